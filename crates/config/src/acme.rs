//! ACME certificate management configuration.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Lock the shared store through a versioned secret vault.
pub const LOCK_MODE_VAULT: &str = "vault";
/// No cross-instance locking; only one instance may renew.
pub const LOCK_MODE_NONE: &str = "none";

/// ACME challenge types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeType {
    /// DNS-01: publish a TXT record at `_acme-challenge.<domain>`
    #[serde(rename = "dns-01")]
    Dns01,
    /// HTTP-01: serve the token on `/.well-known/acme-challenge/`
    #[serde(rename = "http-01")]
    Http01,
}

impl Default for ChallengeType {
    fn default() -> Self {
        ChallengeType::Dns01
    }
}

/// Leaf key algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// ECDSA P-256 (default)
    #[serde(rename = "EC")]
    Ec,
    /// RSA-2048
    #[serde(rename = "RSA")]
    Rsa,
}

impl Default for KeyType {
    fn default() -> Self {
        KeyType::Ec
    }
}

/// Shared certificate store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Identifier of the secret holding the certificate bundle
    pub secret_id: String,

    /// Locking discipline: "vault" (default) or "none".
    ///
    /// "none" means only one instance may renew; it exists for single-host
    /// deployments whose secret backend has no version stages.
    #[serde(default = "default_lock_mode")]
    pub lock_mode: String,
}

fn default_lock_mode() -> String {
    LOCK_MODE_VAULT.to_string()
}

/// ACME certificate manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Domain names (SANs) to request certificates for. The first name is
    /// the subject common name.
    pub domain_names: Vec<String>,

    /// CA directory endpoint. Defaults to Let's Encrypt production.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Challenge type to solve
    #[serde(default)]
    pub challenge_type: ChallengeType,

    /// Leaf key algorithm
    #[serde(default)]
    pub key_type: KeyType,

    /// Port for the local http-01 listener. Use this when a firewall DNATs
    /// public port 80 to a different internal port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Address ("host:port") of an ACME http-01 proxy. When set, challenge
    /// responses are published to the proxy instead of a local listener.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Bind a plain-HTTP listener on this port that redirects everything
    /// to HTTPS. Only used when no local http-01 listener claims port 80.
    #[serde(default)]
    pub http_redirect_port: Option<u16>,

    /// Shared certificate store, for fleets.
    #[serde(default)]
    pub store: Option<StoreConfig>,

    /// Renew when this fraction of the certificate lifetime remains.
    /// Defaults to a random value in [0.32, 0.34) chosen at startup.
    #[serde(default)]
    pub renew_before: Option<f64>,
}

fn default_directory_url() -> String {
    LETSENCRYPT_PRODUCTION.to_string()
}

fn default_http_port() -> u16 {
    80
}

impl AcmeConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.domain_names.is_empty() {
            return Err(ConfigError::Invalid(
                "acme.domain_names must list at least one name".into(),
            ));
        }
        if let Some(renew_before) = self.renew_before {
            if !(0.0..1.0).contains(&renew_before) {
                return Err(ConfigError::Invalid(format!(
                    "acme.renew_before = {} is outside (0, 1)",
                    renew_before
                )));
            }
        }
        if self.proxy.is_some() && self.challenge_type != ChallengeType::Http01 {
            return Err(ConfigError::Invalid(
                "acme.proxy is only meaningful with challenge_type = \"http-01\"".into(),
            ));
        }
        if let Some(port) = self.http_redirect_port {
            if self.challenge_type == ChallengeType::Http01
                && self.proxy.is_none()
                && port == self.http_port
            {
                return Err(ConfigError::Invalid(format!(
                    "acme.http_redirect_port = {} collides with the http-01 listener",
                    port
                )));
            }
        }
        if let Some(store) = &self.store {
            match store.lock_mode.as_str() {
                LOCK_MODE_VAULT | LOCK_MODE_NONE => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "acme.store.lock_mode = {:?} is not one of \"vault\", \"none\"",
                        other
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let acme: AcmeConfig = toml::from_str(
            r#"
            domain_names = ["www.example.com", "example.com"]
        "#,
        )
        .unwrap();
        assert_eq!(acme.directory_url, LETSENCRYPT_PRODUCTION);
        assert_eq!(acme.challenge_type, ChallengeType::Dns01);
        assert_eq!(acme.key_type, KeyType::Ec);
        assert_eq!(acme.http_port, 80);
        assert!(acme.renew_before.is_none());
        acme.validate().unwrap();
    }

    #[test]
    fn test_proxy_requires_http01() {
        let acme: AcmeConfig = toml::from_str(
            r#"
            domain_names = ["www.example.com"]
            proxy = "acme-proxy.internal:6941"
        "#,
        )
        .unwrap();
        assert!(acme.validate().is_err());

        let acme: AcmeConfig = toml::from_str(
            r#"
            domain_names = ["www.example.com"]
            challenge_type = "http-01"
            proxy = "acme-proxy.internal:6941"
        "#,
        )
        .unwrap();
        acme.validate().unwrap();
    }

    #[test]
    fn test_bad_lock_mode_rejected() {
        let acme: AcmeConfig = toml::from_str(
            r#"
            domain_names = ["www.example.com"]

            [store]
            secret_id = "flotilla/cert"
            lock_mode = "hope"
        "#,
        )
        .unwrap();
        assert!(acme.validate().is_err());
    }

    #[test]
    fn test_redirect_port_collision() {
        let acme: AcmeConfig = toml::from_str(
            r#"
            domain_names = ["www.example.com"]
            challenge_type = "http-01"
            http_redirect_port = 80
        "#,
        )
        .unwrap();
        assert!(acme.validate().is_err());

        let acme: AcmeConfig = toml::from_str(
            r#"
            domain_names = ["www.example.com"]
            http_redirect_port = 80
        "#,
        )
        .unwrap();
        acme.validate().unwrap();
    }

    #[test]
    fn test_renew_before_bounds() {
        let acme: AcmeConfig = toml::from_str(
            r#"
            domain_names = ["www.example.com"]
            renew_before = 1.5
        "#,
        )
        .unwrap();
        assert!(acme.validate().is_err());
    }
}
