//! Certificate manager error types

use std::io;
use thiserror::Error;

use flotilla_dns::RecordStoreError;

/// Errors that can occur during certificate management
#[derive(Debug, Error)]
pub enum CertError {
    /// No certificate has been issued or loaded yet
    #[error("no certificate available")]
    NoCertificate,

    /// Failed to create the ACME account
    #[error("failed to create ACME account: {0}")]
    AccountCreation(String),

    /// Failed to create or refresh the certificate order
    #[error("failed to create certificate order: {0}")]
    OrderCreation(String),

    /// Authorization failed for a domain
    #[error("authorization failed for domain '{domain}': {message}")]
    Authorization { domain: String, message: String },

    /// Certificate finalization failed
    #[error("failed to finalize certificate: {0}")]
    Finalization(String),

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// ACME protocol error
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// The cross-process lock was lost during the ACME transaction
    #[error("lock lost during ACME transaction")]
    LockLost,

    /// Certificate or key parsing error
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    /// Unsupported leaf key type
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Invalid manager construction
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Challenge responder failed
    #[error(transparent)]
    Responder(#[from] ResponderError),

    /// Shared store or locker failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local file IO failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<instant_acme::Error> for CertError {
    fn from(e: instant_acme::Error) -> Self {
        CertError::Protocol(e.to_string())
    }
}

/// Errors from the shared certificate store and its locker
#[derive(Debug, Error)]
pub enum StoreError {
    /// The bundle has never been written
    #[error("certificate bundle not found in store")]
    NotFound,

    /// The backend is unreachable or misbehaving; retry later
    #[error("store backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Lock() called while the lock is already held by this instance
    #[error("lock already held")]
    AlreadyHeld,

    /// Unlock() called without holding the lock
    #[error("lock not held")]
    NotLocked,

    /// The requested version stage is attached to another version
    #[error("stage '{stage}' is held by version {version}")]
    StageConflict { stage: String, version: String },

    /// Bundle (de)serialization failed
    #[error("bundle codec error: {0}")]
    Codec(String),
}

/// Errors from challenge responders
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The key does not name an ACME challenge
    #[error("not an ACME challenge response: {0}")]
    NotAcmeChallenge(String),

    /// Publishing to the ACME proxy failed
    #[error("failed to publish challenge response: {0}")]
    Publish(String),

    /// The DNS record store rejected the challenge record
    #[error(transparent)]
    Dns(#[from] RecordStoreError),
}
