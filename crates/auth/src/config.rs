//! Client configuration
//!
//! [`AuthConfig`] describes the Keycloak realm and the public client this
//! crate talks to. It can be built in code, loaded from environment
//! variables, or read from a TOML/JSON file.
//!
//! ## Environment Variables
//! - `KEYCLOAK_SERVER_URL`: Keycloak base URL (required)
//! - `KEYCLOAK_CLIENT_ID`: OAuth client id (required)
//! - `KEYCLOAK_REALM`: Realm name (default `peppertree`)
//! - `KEYCLOAK_CLIENT_SECRET`: Client secret, confidential clients only
//! - `KEYCLOAK_REDIRECT_PATH`: Callback path on the current origin (default
//!   `/admin/callback`)
//! - `KEYCLOAK_SCOPES`: Space-separated scopes (default `openid profile
//!   email`)
//! - `KEYCLOAK_ADMIN_ROLES`: Comma-separated admin role aliases (default
//!   `admin,peppertree-admin`)
//! - `KEYCLOAK_HTTP_TIMEOUT_SECS`: Per-request timeout (default 10)
//! - `KEYCLOAK_PROBE_CACHE_SECS`: How long a successful validity probe is
//!   trusted (default 5, `0` disables)

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{AuthError, AuthResult};

const DEFAULT_REALM: &str = "peppertree";
const DEFAULT_REDIRECT_PATH: &str = "/admin/callback";
const DEFAULT_SCOPES: [&str; 3] = ["openid", "profile", "email"];
const DEFAULT_ADMIN_ROLES: [&str; 2] = ["admin", "peppertree-admin"];
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PROBE_CACHE_SECS: u64 = 5;

/// Config file names probed by [`load`] in the working directory
const CONFIG_FILE_CANDIDATES: [&str; 4] =
    ["peppertree-auth.toml", "peppertree-auth.json", "config/auth.toml", "config/auth.json"];

/// Keycloak client configuration
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AuthConfig {
    /// Keycloak base URL, e.g. `https://auth.peppertree.example`
    pub server_url: Url,

    /// Realm name
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Public client id
    pub client_id: String,

    /// Client secret for confidential clients; never set for browser clients
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Absolute path of the callback route on the current origin
    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,

    /// Requested scopes; must include `openid`
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Role names that all mean "administrator"
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Lifetime of a cached successful validity probe in seconds
    #[serde(default = "default_probe_cache_secs")]
    pub probe_cache_secs: u64,

    /// Replaces the derived `{server}/realms/{realm}/protocol/openid-connect`
    #[serde(default)]
    pub endpoints_base: Option<Url>,
}

fn default_realm() -> String {
    DEFAULT_REALM.to_string()
}

fn default_redirect_path() -> String {
    DEFAULT_REDIRECT_PATH.to_string()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(ToString::to_string).collect()
}

fn default_admin_roles() -> Vec<String> {
    DEFAULT_ADMIN_ROLES.iter().map(ToString::to_string).collect()
}

const fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

const fn default_probe_cache_secs() -> u64 {
    DEFAULT_PROBE_CACHE_SECS
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("server_url", &self.server_url.as_str())
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("redirect_path", &self.redirect_path)
            .field("scopes", &self.scopes)
            .field("admin_roles", &self.admin_roles)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("probe_cache_secs", &self.probe_cache_secs)
            .field("endpoints_base", &self.endpoints_base.as_ref().map(Url::as_str))
            .finish()
    }
}

impl AuthConfig {
    /// Create a configuration with defaults for everything but the server
    /// and client id
    #[must_use]
    pub fn new(server_url: Url, client_id: impl Into<String>) -> Self {
        Self {
            server_url,
            realm: default_realm(),
            client_id: client_id.into(),
            client_secret: None,
            redirect_path: default_redirect_path(),
            scopes: default_scopes(),
            admin_roles: default_admin_roles(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            probe_cache_secs: DEFAULT_PROBE_CACHE_SECS,
            endpoints_base: None,
        }
    }

    /// Set the realm
    #[must_use]
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Set a client secret (confidential clients)
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Set the callback path
    #[must_use]
    pub fn with_redirect_path(mut self, path: impl Into<String>) -> Self {
        self.redirect_path = path.into();
        self
    }

    /// Replace the requested scopes
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the admin role aliases
    #[must_use]
    pub fn with_admin_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admin_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Set the HTTP timeout (whole seconds)
    #[must_use]
    pub const fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the probe cache lifetime (whole seconds, zero disables)
    #[must_use]
    pub const fn with_probe_cache_ttl(mut self, ttl: Duration) -> Self {
        self.probe_cache_secs = ttl.as_secs();
        self
    }

    /// Override the OpenID Connect endpoint base
    #[must_use]
    pub fn with_endpoints_base(mut self, base: Url) -> Self {
        self.endpoints_base = Some(base);
        self
    }

    /// Load configuration from environment variables
    ///
    /// See the module documentation for the variable list.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if required variables are missing
    /// or have invalid values.
    pub fn from_env() -> AuthResult<Self> {
        let server_url = parse_url("KEYCLOAK_SERVER_URL", &env_var("KEYCLOAK_SERVER_URL")?)?;
        let client_id = env_var("KEYCLOAK_CLIENT_ID")?;

        let mut config = Self::new(server_url, client_id);

        if let Some(realm) = env_opt("KEYCLOAK_REALM") {
            config.realm = realm;
        }
        config.client_secret = env_opt("KEYCLOAK_CLIENT_SECRET");
        if let Some(path) = env_opt("KEYCLOAK_REDIRECT_PATH") {
            config.redirect_path = path;
        }
        if let Some(scopes) = env_opt("KEYCLOAK_SCOPES") {
            config.scopes = split_list(&scopes);
        }
        if let Some(roles) = env_opt("KEYCLOAK_ADMIN_ROLES") {
            config.admin_roles = split_list(&roles);
        }
        if let Some(secs) = env_opt("KEYCLOAK_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = parse_secs("KEYCLOAK_HTTP_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = env_opt("KEYCLOAK_PROBE_CACHE_SECS") {
            config.probe_cache_secs = parse_secs("KEYCLOAK_PROBE_CACHE_SECS", &secs)?;
        }

        Ok(config)
    }

    /// Load configuration from a TOML or JSON file
    ///
    /// Format is detected by extension; anything that is not `.toml` is
    /// parsed as JSON.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if the file cannot be read or
    /// parsed.
    pub fn from_file(path: impl AsRef<Path>) -> AuthResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AuthError::Configuration(format!("Failed to read {}: {e}", path.display()))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| AuthError::Configuration(format!("Invalid TOML format: {e}"))),
            _ => serde_json::from_str(&contents)
                .map_err(|e| AuthError::Configuration(format!("Invalid JSON format: {e}"))),
        }
    }

    /// Check the configuration for values that can never work
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` describing the first problem found
    pub fn validate(&self) -> AuthResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::Configuration("client_id must not be empty".to_string()));
        }
        if self.realm.trim().is_empty() {
            return Err(AuthError::Configuration("realm must not be empty".to_string()));
        }
        if !self.scopes.iter().any(|s| s == "openid") {
            return Err(AuthError::Configuration("scopes must include \"openid\"".to_string()));
        }
        if !self.redirect_path.starts_with('/') || self.redirect_path.starts_with("//") {
            return Err(AuthError::Configuration(format!(
                "redirect_path must be an absolute path, got {:?}",
                self.redirect_path
            )));
        }
        if self.http_timeout_secs == 0 {
            return Err(AuthError::Configuration("http_timeout_secs must be positive".to_string()));
        }
        self.endpoints_base()?;
        Ok(())
    }

    /// Base of the OpenID Connect endpoints
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if the server URL cannot carry a
    /// path
    pub fn endpoints_base(&self) -> AuthResult<Url> {
        if let Some(base) = &self.endpoints_base {
            return Ok(base.clone());
        }
        let mut url = self.server_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                AuthError::Configuration(format!("Invalid server URL: {}", self.server_url))
            })?
            .pop_if_empty()
            .extend(["realms", self.realm.as_str(), "protocol", "openid-connect"]);
        Ok(url)
    }

    fn endpoint(&self, name: &str) -> AuthResult<Url> {
        let mut url = self.endpoints_base()?;
        url.path_segments_mut()
            .map_err(|()| AuthError::Configuration("Invalid endpoint base".to_string()))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

    /// Authorization endpoint
    ///
    /// # Errors
    /// See [`Self::endpoints_base`]
    pub fn authorization_url(&self) -> AuthResult<Url> {
        self.endpoint("auth")
    }

    /// Token endpoint
    ///
    /// # Errors
    /// See [`Self::endpoints_base`]
    pub fn token_url(&self) -> AuthResult<Url> {
        self.endpoint("token")
    }

    /// Userinfo endpoint
    ///
    /// # Errors
    /// See [`Self::endpoints_base`]
    pub fn userinfo_url(&self) -> AuthResult<Url> {
        self.endpoint("userinfo")
    }

    /// Logout endpoint
    ///
    /// # Errors
    /// See [`Self::endpoints_base`]
    pub fn logout_url(&self) -> AuthResult<Url> {
        self.endpoint("logout")
    }

    /// Redirect URI for the given origin.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if the path cannot be joined
    pub fn redirect_uri(&self, origin: &Url) -> AuthResult<Url> {
        origin.join(&self.redirect_path).map_err(|e| {
            AuthError::Configuration(format!("Invalid redirect path {:?}: {e}", self.redirect_path))
        })
    }

    /// Get scopes as space-separated string
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// HTTP request timeout
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Probe cache lifetime
    #[must_use]
    pub const fn probe_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_cache_secs)
    }
}

/// Load and validate configuration
///
/// Environment variables are tried first. If they are incomplete, `path` is
/// read, or when `path` is `None` the first existing file among
/// [`probe_config_paths`].
///
/// # Errors
/// Returns `AuthError::Configuration` if no source yields a valid
/// configuration
pub fn load(path: Option<PathBuf>) -> AuthResult<AuthConfig> {
    let config = match AuthConfig::from_env() {
        Ok(config) => {
            tracing::info!("Auth configuration loaded from environment variables");
            config
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to load auth config from environment, trying file");
            let path = match path {
                Some(p) => p,
                None => probe_config_paths().ok_or_else(|| {
                    AuthError::Configuration(
                        "No auth config file found in any of the standard locations".to_string(),
                    )
                })?,
            };
            tracing::info!(path = %path.display(), "Loading auth configuration from file");
            AuthConfig::from_file(&path)?
        }
    };

    config.validate()?;
    Ok(config)
}

/// Candidate config files relative to the working directory, first existing
/// one wins
#[must_use]
pub fn probe_config_paths() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    CONFIG_FILE_CANDIDATES.iter().map(|name| cwd.join(name)).find(|path| path.exists())
}

/// Get required environment variable
fn env_var(key: &str) -> AuthResult<String> {
    env_opt(key).ok_or_else(|| {
        AuthError::Configuration(format!("Missing required environment variable: {key}"))
    })
}

/// Get optional environment variable, treating empty values as unset
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_url(key: &str, raw: &str) -> AuthResult<Url> {
    Url::parse(raw).map_err(|e| AuthError::Configuration(format!("Invalid URL in {key}: {e}")))
}

fn parse_secs(key: &str, raw: &str) -> AuthResult<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| AuthError::Configuration(format!("Invalid number in {key}: {e}")))
}

/// Split on commas and whitespace
fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
