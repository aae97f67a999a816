//! Gateway signature scheme: hex SHA-256 over `:`-joined fields followed by
//! the custom `Shp_*` parameters as `key=value`, sorted by key.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

pub const SHP_PREFIX: &str = "Shp_";

pub fn sign(parts: &[&str], shp: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(":").as_bytes());
    for (key, value) in shp {
        hasher.update(b":");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Case-insensitive comparison that does not stop at the first difference.
pub fn verify(expected: &str, received: &str) -> bool {
    let (a, b) = (expected.as_bytes(), received.trim().as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b)
        .fold(0u8, |acc, (x, y)| acc | (x.to_ascii_lowercase() ^ y.to_ascii_lowercase()))
        == 0
}

/// Parse a decimal amount as the gateway formats it (`300`, `300.00`, `300.000000`).
pub fn parse_amount(text: &str) -> Option<Decimal> {
    Decimal::from_str(text.trim()).ok()
}

/// True for `Shp_`-prefixed keys, matched case-insensitively.
pub fn is_shp_key(key: &str) -> bool {
    key.len() > SHP_PREFIX.len()
        && key.is_char_boundary(SHP_PREFIX.len())
        && key[..SHP_PREFIX.len()].eq_ignore_ascii_case(SHP_PREFIX)
}
