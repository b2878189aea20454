//! Shared types and helpers for the flotilla crates.
//!
//! Everything here is deliberately small: DNS name canonicalization, the
//! record-type vocabulary shared by the record store and its consumers, the
//! jitter helpers used by every periodic loop in the workspace, and the
//! wire constants of the ACME proxy protocol.

pub mod api;
pub mod jitter;
pub mod types;

pub use types::{canonical_fqdn, RecordType};
