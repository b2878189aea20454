//! Wire constants shared between the certificate manager, the ACME proxy
//! and its publisher client.

/// Well-known path prefix for ACME http-01 challenges (no trailing slash)
pub const ACME_PATH: &str = "/.well-known/acme-challenge";

/// ACME proxy admin endpoint: record one challenge response
pub const PROXY_RECORD_RESPONSE: &str = "/api/responses/recordOne";

/// ACME proxy admin endpoint: drop all responses for the calling peer
pub const PROXY_CLEANUP_RESPONSES: &str = "/api/responses/cleanup";

/// Default ACME proxy admin port
pub const ACME_PROXY_ADMIN_PORT: u16 = 6941;
