//! Cluster-scoped http-01 challenge relay.
//!
//! Fleets behind one public address cannot all bind port 80; the ACME
//! proxy does it for them. Peers publish their challenge responses to the
//! proxy's admin surface; the CA's validation request arrives on the
//! public surface, where the proxy answers from the recorded responses of
//! whichever peers the requested host resolves to, and otherwise forwards
//! the request to the named host itself.
//!
//! # Surfaces
//!
//! - Public (default port 80): `GET /.well-known/acme-challenge/<token>`
//!   only. Resolution order: recorded response of a peer the `Host`
//!   resolves to, then a forward to `http://<host><path>`, then (on 404,
//!   if configured) a forward to the fallback port.
//! - Admin: `POST /api/responses/recordOne?<path>` and
//!   `POST /api/responses/cleanup`, keyed by the caller's TCP source IP.

mod resolver;
mod responses;
mod server;

pub use resolver::{DnsHostResolver, HostResolver};
pub use responses::{RecordOutcome, ResponseStore, MAX_RESPONSES_PER_PEER, MAX_RESPONSE_SIZE};
pub use server::{admin_router, public_router, AcmeProxy, ProxyError};
