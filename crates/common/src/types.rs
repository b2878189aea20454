//! DNS vocabulary shared across the workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// DNS record types the record store deals in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// Text record
    #[serde(rename = "TXT")]
    Txt,
}

impl RecordType {
    /// Wire name of the record type
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Txt => "TXT",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonicalize an FQDN to its wire form with a trailing dot.
///
/// Names are compared in canonical form everywhere; providers that return
/// unterminated names are normalized on read as well as on write.
pub fn canonical_fqdn(fqdn: &str) -> String {
    if fqdn.ends_with('.') {
        fqdn.to_string()
    } else {
        format!("{}.", fqdn)
    }
}
