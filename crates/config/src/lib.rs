//! Configuration for flotilla daemons and tools.
//!
//! Configuration is a TOML file deserialized into the structs below and
//! validated before anything is constructed from it. The file has three
//! sections:
//!
//! ```toml
//! cert_file = "/var/lib/flotilla/cert.pem"
//! key_file = "/var/lib/flotilla/key.pem"
//!
//! [acme]
//! domain_names = ["www.example.com"]
//! challenge_type = "dns-01"
//!
//! [dns]
//! zone = "example.com"
//! api_token_file = "/etc/flotilla/dns-token"
//!
//! [lb]
//! fqdn = "www.example.com"
//! tcp_port = 443
//! do_tls = true
//! ```
//!
//! Validation failures are fatal at startup (exit code 1); a missing or
//! unreadable file is reported the same way.

mod acme;
mod lb;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use acme::{AcmeConfig, ChallengeType, KeyType, StoreConfig, LOCK_MODE_NONE, LOCK_MODE_VAULT};
pub use lb::{ComputeConfig, LbConfig};

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration shared by `flotillad` and `dnslb-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local certificate cache path (PEM chain). Empty disables the cache.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// Local private key cache path (PEM). Empty disables the cache.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// ACME certificate management
    #[serde(default)]
    pub acme: Option<AcmeConfig>,

    /// DNS record store backend
    #[serde(default)]
    pub dns: Option<DnsBackendConfig>,

    /// DNS load balancer
    #[serde(default)]
    pub lb: Option<LbConfig>,
}

/// DNS record store backend settings.
///
/// The zone is the suffix under which all managed records live; the API
/// token is loaded from a file so that the configuration itself can be
/// world-readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsBackendConfig {
    /// DNS zone name (e.g. "example.com")
    pub zone: String,

    /// File containing the DNS provider API token
    pub api_token_file: PathBuf,

    /// Provider API timeout in seconds
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
}

fn default_api_timeout_secs() -> u64 {
    30
}

impl DnsBackendConfig {
    /// Read the provider API token, trimming trailing whitespace.
    pub fn read_token(&self) -> Result<String, ConfigError> {
        let raw = std::fs::read_to_string(&self.api_token_file).map_err(|e| ConfigError::Io {
            path: self.api_token_file.clone(),
            source: e,
        })?;
        Ok(raw.trim().to_string())
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-section constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(acme) = &self.acme {
            acme.validate()?;
            if acme.challenge_type == ChallengeType::Dns01 && self.dns.is_none() {
                return Err(ConfigError::Invalid(
                    "acme.challenge_type = \"dns-01\" requires a [dns] section".into(),
                ));
            }
            if self.cert_file.is_some() != self.key_file.is_some() {
                return Err(ConfigError::Invalid(
                    "cert_file and key_file must be set together".into(),
                ));
            }
        }
        if let Some(lb) = &self.lb {
            lb.validate()?;
            if self.dns.is_none() {
                return Err(ConfigError::Invalid(
                    "[lb] requires a [dns] section for the record store".into(),
                ));
            }
        }
        Ok(())
    }
}
