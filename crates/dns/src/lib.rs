//! DNS record store adapters.
//!
//! The rest of the workspace manages DNS state (load-balancer A sets,
//! `_blocked` coordination records, ACME challenge TXT records) through the
//! [`RecordStore`] capability. A store deals in whole record-sets: a write
//! replaces every record of the given name and type, it never appends.
//!
//! # Implementations
//!
//! - [`HetznerRecordStore`] - Hetzner DNS REST API
//! - [`MemoryRecordStore`] - in-memory store for tests and dry runs
//!
//! # Conventions
//!
//! FQDNs are canonicalized to the trailing-dot wire form on every call.
//! TXT values are quoted on the wire and unquoted in memory; adapters do
//! the conversion at the provider boundary. Writes with `wait` block until
//! the change is visible to resolvers or a two-minute timeout elapses, in
//! which case the write is reported successful with a warning: providers
//! are assumed eventually consistent.

mod hetzner;
mod memory;
mod propagation;
mod store;

pub use hetzner::HetznerRecordStore;
pub use memory::MemoryRecordStore;
pub use propagation::{PropagationChecker, PropagationConfig};
pub use store::{quote_txt, unquote_txt, DnsResult, RecordStore, RecordStoreError};
