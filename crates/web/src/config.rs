//! Web service configuration
//!
//! Loaded from an optional TOML file, then overridden by `RELAYGATE_*`
//! environment variables, then validated. Missing secrets are fatal.

use relaygate_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::desktop::matching::MatchPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP listen address
    pub listen_addr: String,

    /// SQLite database path
    pub database_path: PathBuf,

    /// Vault key material (truncated or padded to 32 bytes)
    pub vault_key: Option<String>,

    /// HS256 secret for owner bearer tokens
    pub jwt_secret: Option<String>,

    /// Allowed CORS origin; any origin when unset
    pub cors_origin: Option<String>,

    /// Desktop gateway configuration
    pub gateway: GatewayConfig,

    /// Terminal bridge configuration
    pub ssh: SshConfig,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            database_path: relaygate_common::default_db_path(),
            vault_key: None,
            jwt_secret: None,
            cors_origin: None,
            gateway: GatewayConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

/// Remote desktop gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Internal base URL used for API calls
    pub url: Option<String>,

    /// Browser-reachable base URL; defaults to `url`
    pub public_url: Option<String>,

    /// Service account
    pub username: String,
    pub password: String,

    /// Timeout for each gateway API call
    pub timeout_secs: u64,

    /// Lifetime assumed for a gateway auth token
    pub credential_ttl_secs: u64,

    /// Refresh this long before the credential expires
    pub refresh_margin_secs: u64,

    /// Data source used when discovery is inconclusive
    pub fallback_data_source: String,

    /// Ordered connection reuse policies
    pub policies: Vec<MatchPolicy>,

    /// Name of the pre-provisioned connection for the sentinel policy
    pub sentinel_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            public_url: None,
            username: "guacadmin".to_string(),
            password: "guacadmin".to_string(),
            timeout_secs: 10,
            credential_ttl_secs: 3600,
            refresh_margin_secs: 60,
            fallback_data_source: "postgresql".to_string(),
            policies: MatchPolicy::default_order(),
            sentinel_name: "test".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Internal base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.url.as_deref().unwrap_or_default().trim_end_matches('/')
    }

    /// Public base URL without a trailing slash
    pub fn public_base_url(&self) -> &str {
        self.public_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| self.base_url())
            .trim_end_matches('/')
    }
}

/// SSH session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,

    /// Terminal type sent with the PTY request
    pub term: String,

    pub cols: u32,
    pub rows: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 20,
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl WebConfig {
    /// Load configuration: file (if any), then environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Apply `RELAYGATE_*` overrides from `lookup`; unparsable values are rejected
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RELAYGATE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("RELAYGATE_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("RELAYGATE_VAULT_KEY") {
            self.vault_key = Some(v);
        }
        if let Some(v) = get("RELAYGATE_JWT_SECRET") {
            self.jwt_secret = Some(v);
        }
        if let Some(v) = get("RELAYGATE_CORS_ORIGIN") {
            self.cors_origin = Some(v);
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_URL") {
            self.gateway.url = Some(v);
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_PUBLIC_URL") {
            self.gateway.public_url = Some(v);
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_USERNAME") {
            self.gateway.username = v;
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_PASSWORD") {
            self.gateway.password = v;
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_TIMEOUT_SECS") {
            self.gateway.timeout_secs = parse_secs("RELAYGATE_GATEWAY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_FALLBACK_DATA_SOURCE") {
            self.gateway.fallback_data_source = v;
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_POLICIES") {
            self.gateway.policies = MatchPolicy::parse_list(&v)
                .map_err(|e| Error::InvalidConfig(format!("RELAYGATE_GATEWAY_POLICIES: {}", e)))?;
        }
        if let Some(v) = get("RELAYGATE_GATEWAY_SENTINEL_NAME") {
            self.gateway.sentinel_name = v;
        }
        if let Some(v) = get("RELAYGATE_SSH_CONNECT_TIMEOUT_SECS") {
            self.ssh.connect_timeout_secs = parse_secs("RELAYGATE_SSH_CONNECT_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.vault_key.as_deref().map_or(true, str::is_empty) {
            return Err(Error::InvalidConfig("vault key is not set".to_string()));
        }
        if self.jwt_secret.as_deref().map_or(true, str::is_empty) {
            return Err(Error::InvalidConfig("JWT secret is not set".to_string()));
        }
        if self.gateway.base_url().is_empty() {
            return Err(Error::InvalidConfig("gateway URL is not set".to_string()));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(Error::InvalidConfig("gateway timeout must be positive".to_string()));
        }
        if self.gateway.refresh_margin_secs >= self.gateway.credential_ttl_secs {
            return Err(Error::InvalidConfig(
                "gateway refresh margin must be shorter than the credential lifetime".to_string(),
            ));
        }
        Ok(())
    }

    /// A complete configuration for tests
    pub fn for_testing(gateway_url: &str) -> Self {
        let mut config = Self::default();
        config.vault_key = Some("relaygate-test-vault-key".to_string());
        config.jwt_secret = Some("relaygate-test-jwt-secret".to_string());
        config.gateway.url = Some(gateway_url.to_string());
        config
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}: expected seconds, got {:?}", key, value)))
}
