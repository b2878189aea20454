//! Transport encoding for certificate bundles.
//!
//! A bundle travels through the shared store as a JSON object of
//! Base64-encoded DER values:
//!
//! ```json
//! {
//!   "Certificate0": "<base64 DER leaf>",
//!   "Certificate1": "<base64 DER intermediate>",
//!   "KeyType": "EC",
//!   "PrivateKey": "<base64 DER>"
//! }
//! ```
//!
//! `KeyType` is present exactly when the source PEM carried a typed header
//! (`EC PRIVATE KEY`, `RSA PRIVATE KEY`) and absent for an untyped
//! `PRIVATE KEY` block, so that decoding reconstructs the original PEM
//! byte for byte. Unknown keys (lock sentinels and the like) are ignored.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::bundle::{encode_pem, parse_key_pem, pem_from_chain, CertificateBundle};
use crate::error::StoreError;

const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";

/// Serialize a bundle to its JSON transport form.
pub fn encode_bundle(bundle: &CertificateBundle) -> Result<String, StoreError> {
    let mut map = BTreeMap::new();
    for (index, der) in bundle.chain_der().iter().enumerate() {
        map.insert(format!("Certificate{}", index), BASE64.encode(der));
    }

    let (label, key_der) =
        parse_key_pem(bundle.key_pem()).map_err(|e| StoreError::Codec(e.to_string()))?;
    if label != PRIVATE_KEY_LABEL {
        let key_type = label
            .strip_suffix(&format!(" {}", PRIVATE_KEY_LABEL))
            .ok_or_else(|| StoreError::Codec(format!("private key type {} not supported", label)))?;
        map.insert("KeyType".to_string(), key_type.to_string());
    }
    map.insert("PrivateKey".to_string(), BASE64.encode(&key_der));

    serde_json::to_string(&map).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Deserialize a bundle from its JSON transport form.
pub fn decode_bundle(encoded: &str) -> Result<CertificateBundle, StoreError> {
    let map: HashMap<String, String> =
        serde_json::from_str(encoded).map_err(|e| StoreError::Codec(e.to_string()))?;

    let mut chain_der = Vec::new();
    for index in 0.. {
        match map.get(&format!("Certificate{}", index)) {
            Some(value) => chain_der.push(decode_base64(value)?),
            None if index == 0 => return Err(StoreError::Codec("no Certificate in map".into())),
            None => break,
        }
    }
    let cert_pem = pem_from_chain(&chain_der);

    let key_der = map
        .get("PrivateKey")
        .ok_or_else(|| StoreError::Codec("no PrivateKey in map".into()))
        .and_then(|v| decode_base64(v))?;
    let label = match map.get("KeyType") {
        Some(key_type) => format!("{} {}", key_type, PRIVATE_KEY_LABEL),
        None => PRIVATE_KEY_LABEL.to_string(),
    };
    let key_pem = encode_pem(&label, &key_der);

    CertificateBundle::from_pem(cert_pem, key_pem).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Some stores re-wrap secrets and introduce whitespace into the values.
fn decode_base64(value: &str) -> Result<Vec<u8>, StoreError> {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(cleaned.as_bytes())
        .map_err(|e| StoreError::Codec(e.to_string()))
}
