//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The issuer client secret is loaded from the ISSUER_CLIENT_SECRET env var
//! or client_secret_file, never stored in the TOML directly to avoid leaking
//! secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding the issuer client secret
pub const CLIENT_SECRET_ENV: &str = "ISSUER_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub issuer: IssuerConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Token endpoint settings
#[derive(Debug, Deserialize)]
pub struct IssuerConfig {
    pub token_url: String,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to the env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    /// Upper bound on one refresh call
    #[serde(default = "default_issuer_timeout")]
    pub timeout_secs: u64,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session persistence and refresh policy
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Where the credential is persisted. In-memory only when unset.
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    /// Subject reported for a session restored from `credential_file`
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Background refresh kicks in when the credential expires within this
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    /// Refresh before the call when the credential expires within this
    #[serde(default = "default_expiry_leeway")]
    pub expiry_leeway_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_file: None,
            subject: default_subject(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
            expiry_leeway_secs: default_expiry_leeway(),
        }
    }
}

impl SessionConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    pub fn expiry_leeway(&self) -> Duration {
        Duration::from_secs(self.expiry_leeway_secs)
    }
}

fn default_issuer_timeout() -> u64 {
    30
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_subject() -> String {
    "default".into()
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    900
}

fn default_expiry_leeway() -> u64 {
    30
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. ISSUER_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        require_http_url("upstream_url", &config.proxy.upstream_url)?;
        require_http_url("token_url", &config.issuer.token_url)?;

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if config.issuer.timeout_secs == 0 {
            return Err(common::Error::Config(
                "issuer timeout_secs must be greater than 0".into(),
            ));
        }
        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.session.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0".into(),
            ));
        }

        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.issuer.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.issuer.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.issuer.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-proxy.toml")
    }
}
