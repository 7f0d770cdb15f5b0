//! Role inspection for UI gating
//!
//! Decodes the access token's payload without verifying its signature.
//! Results are hints for what to render; anything consequential must be
//! authorized again by the API that receives the token.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::crypto::base64url_decode_lenient;
use crate::error::AuthError;
use crate::session::SessionMachine;

/// Roles granted in one scope of a Keycloak token
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoleSet {
    /// Role names
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims from an access token payload
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Claims {
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiry (seconds since epoch)
    #[serde(default)]
    pub exp: Option<i64>,
    /// Login name
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Email address
    #[serde(default)]
    pub email: Option<String>,
    /// Realm-level roles
    #[serde(default)]
    pub realm_access: Option<RoleSet>,
    /// Client-level roles keyed by client id
    #[serde(default)]
    pub resource_access: HashMap<String, RoleSet>,
    /// Everything else
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// Decode the payload segment of a JWT.
    ///
    /// The signature is ignored.
    ///
    /// # Errors
    /// Returns [`AuthError::Decode`] if the token is not three segments or
    /// the payload is not base64-encoded JSON
    pub fn decode(token: &str) -> Result<Self, AuthError> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_header), Some(payload), Some(_signature), None) => payload,
            _ => return Err(AuthError::Decode("token is not a three-part JWT".to_string())),
        };

        let bytes = base64url_decode_lenient(payload)
            .map_err(|e| AuthError::Decode(format!("payload is not base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::Decode(format!("payload is not a claims object: {e}")))
    }

    /// Realm-level role names
    #[must_use]
    pub fn realm_roles(&self) -> &[String] {
        self.realm_access.as_ref().map_or(&[][..], |access| access.roles.as_slice())
    }

    /// Role names granted for `client_id`
    #[must_use]
    pub fn client_roles(&self, client_id: &str) -> &[String] {
        self.resource_access.get(client_id).map_or(&[][..], |access| access.roles.as_slice())
    }

    /// Whether `role` is held at realm level or for `client_id`
    #[must_use]
    pub fn has_role(&self, role: &str, client_id: &str) -> bool {
        self.realm_roles().iter().chain(self.client_roles(client_id)).any(|r| r == role)
    }
}

/// Answers capability questions about the current session
pub struct RoleInspector {
    session: Arc<SessionMachine>,
    client_id: String,
    admin_roles: Vec<String>,
}

impl RoleInspector {
    /// Inspect tokens held by `session`
    #[must_use]
    pub fn new(session: Arc<SessionMachine>, client_id: impl Into<String>, admin_roles: Vec<String>) -> Self {
        Self { session, client_id: client_id.into(), admin_roles }
    }

    /// Claims of the current access token, decoded afresh on every call
    #[must_use]
    pub fn claims(&self) -> Option<Claims> {
        let token = self.session.access_token()?;
        match Claims::decode(&token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                debug!(error = %e, "Could not decode access token claims");
                None
            }
        }
    }

    /// Whether the current session holds role `name` (realm or this client)
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.claims().is_some_and(|claims| claims.has_role(name, &self.client_id))
    }

    /// Whether the current session holds any admin role alias
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.claims().is_some_and(|claims| {
            self.admin_roles.iter().any(|role| claims.has_role(role, &self.client_id))
        })
    }
}
