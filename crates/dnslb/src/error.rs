//! Load balancer error types

use thiserror::Error;

use flotilla_dns::RecordStoreError;

/// Errors from the DNS load balancer and its operator actions
#[derive(Debug, Error)]
pub enum LbError {
    /// Invalid construction parameters
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The DNS record store failed
    #[error(transparent)]
    Dns(#[from] RecordStoreError),

    /// The compute provider failed
    #[error("compute provider error: {0}")]
    Compute(String),

    /// The `_blocked` record is held by another operator
    #[error("blocked by another owner: {owner}")]
    BlockedByOther { owner: String },

    /// A rolling replace needs at least two regional instances
    #[error("need 2+ regional IPs, have {found}")]
    NoQuorum { found: usize },

    /// Some regional IP is already blocked
    #[error("some IP(s) are blocked: another rolling replace is active")]
    ReplaceActive,

    /// Block duration out of bounds
    #[error("duration {0} is outside one minute to one hour")]
    BadDuration(String),
}
