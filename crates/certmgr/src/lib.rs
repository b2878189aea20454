//! ACME certificate management for fleets of service instances.
//!
//! Obtains X.509 certificates through the ACME protocol, renews them ahead
//! of expiry, and shares them across instances so a redeployed fleet does
//! not hammer the CA with duplicate orders.
//!
//! # Architecture
//!
//! - [`CertificateManager`] - owns the current bundle and runs the renewal
//!   control loop
//! - [`CertificateBundle`] + [`codec`] - the bundle and its JSON transport
//!   encoding
//! - [`Storer`] / [`Locker`] - shared-store capabilities;
//!   [`VaultLockingStore`] implements both over a versioned secret vault
//! - [`Responder`] - challenge publication: [`HttpResponder`] (local
//!   listener), [`ProxyResponder`] (cluster ACME proxy),
//!   [`DnsResponder`] (TXT records)
//!
//! # Renewal flow
//!
//! The renewal task sleeps until a fraction of the certificate lifetime
//! remains, then: prefers a newer bundle from the shared store; otherwise
//! takes the store lock, double-checks the store, and drives an ACME
//! order through the configured responder. The new bundle is written to
//! the local files atomically, the write notifier fires, and the bundle
//! goes to the store if the lock was held throughout.

pub mod bundle;
pub mod codec;
mod dns;
mod error;
mod file_vault;
mod http;
mod http_proxy;
mod manager;
mod responder;
mod store;
pub mod vault;

#[cfg(test)]
pub(crate) mod testdata;

pub use bundle::CertificateBundle;
pub use dns::DnsResponder;
pub use error::{CertError, ResponderError, StoreError};
pub use file_vault::FileVault;
pub use http::{spawn_redirect_server, Fallback, HttpResponder};
pub use http_proxy::ProxyResponder;
pub use manager::{CertificateManager, ManagerConfig};
pub use responder::Responder;
pub use store::{Locker, NullLocker, Storer};
pub use vault::{MemoryVault, SecretVault, VaultLockingStore};
