//! DNS load balancer configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Minimum allowed check interval
const MIN_CHECK_INTERVAL_SECS: u64 = 5;

/// Compute provider settings for region filtering and instance destruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Provider location/region this controller runs in (e.g. "fsn1")
    pub location: String,

    /// File containing the compute provider API token
    pub api_token_file: PathBuf,

    /// Provider API timeout in seconds
    #[serde(default = "default_compute_timeout_secs")]
    pub api_timeout_secs: u64,
}

fn default_compute_timeout_secs() -> u64 {
    30
}

impl ComputeConfig {
    /// Read the provider API token, trimming trailing whitespace.
    pub fn read_token(&self) -> Result<String, ConfigError> {
        let raw = std::fs::read_to_string(&self.api_token_file).map_err(|e| ConfigError::Io {
            path: self.api_token_file.clone(),
            source: e,
        })?;
        Ok(raw.trim().to_string())
    }
}

/// DNS load balancer controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbConfig {
    /// FQDN of the load-balanced A record set
    pub fqdn: String,

    /// TCP port peers are probed on
    pub tcp_port: u16,

    /// Perform a TLS handshake on top of the TCP probe
    #[serde(default)]
    pub do_tls: bool,

    /// Probe interval in seconds; also used as the A record TTL.
    /// Clamped to a minimum of 5.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Consecutive probe failures before a peer becomes an ejection
    /// candidate
    #[serde(default = "default_minimum_failures")]
    pub minimum_failures: u32,

    /// Consecutive probe failures after which a peer is ejected even if the
    /// region filter cannot see it
    #[serde(default = "default_maximum_failures")]
    pub maximum_failures: u32,

    /// Probe and report, but never terminate instances
    #[serde(default)]
    pub preserve: bool,

    /// Skip region filtering entirely. Requires `preserve`: a controller
    /// must not destroy instances it cannot scope to its own region.
    #[serde(default)]
    pub all_regions: bool,

    /// Compute provider; absent means no region filter and no destroyer.
    #[serde(default)]
    pub compute: Option<ComputeConfig>,
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_minimum_failures() -> u32 {
    3
}

fn default_maximum_failures() -> u32 {
    60
}

impl LbConfig {
    /// The effective check interval, with the floor applied.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(MIN_CHECK_INTERVAL_SECS))
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.fqdn.is_empty() {
            return Err(ConfigError::Invalid("lb.fqdn must not be empty".into()));
        }
        if self.tcp_port == 0 {
            return Err(ConfigError::Invalid("lb.tcp_port must not be zero".into()));
        }
        if self.minimum_failures == 0 {
            return Err(ConfigError::Invalid(
                "lb.minimum_failures must be at least 1".into(),
            ));
        }
        if self.maximum_failures < self.minimum_failures {
            return Err(ConfigError::Invalid(format!(
                "lb.maximum_failures = {} is below lb.minimum_failures = {}",
                self.maximum_failures, self.minimum_failures
            )));
        }
        if self.all_regions && !self.preserve {
            return Err(ConfigError::Invalid(
                "lb.all_regions requires lb.preserve: cannot destroy instances in other regions"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> LbConfig {
        toml::from_str(
            r#"
            fqdn = "www.example.com"
            tcp_port = 443
        "#,
        )
        .unwrap()
    }

    #[test]
    fn test_check_interval_floor() {
        let mut lb = base();
        lb.check_interval_secs = 1;
        assert_eq!(lb.check_interval(), Duration::from_secs(5));
        lb.check_interval_secs = 30;
        assert_eq!(lb.check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_all_regions_requires_preserve() {
        let mut lb = base();
        lb.all_regions = true;
        assert!(lb.validate().is_err());
        lb.preserve = true;
        lb.validate().unwrap();
    }

    #[test]
    fn test_failure_threshold_ordering() {
        let mut lb = base();
        lb.minimum_failures = 10;
        lb.maximum_failures = 5;
        assert!(lb.validate().is_err());
    }
}
