//! Versioned binary encoding
//!
//! Every value that crosses a process boundary (gossip payloads, DA
//! submissions, store values) is encoded as a single leading version byte
//! followed by the bincode representation. The version byte lets future
//! releases change the layout without ambiguity.

use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Current encoding version, written as the first byte of every value.
pub const ENCODING_VERSION: u8 = 1;

/// Encode a value with the leading version byte.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(ENCODING_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a value produced by [`encode`], checking the version byte.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| anyhow!("empty encoding"))?;
    if *version != ENCODING_VERSION {
        return Err(anyhow!(
            "unsupported encoding version: {} (expected {})",
            version,
            ENCODING_VERSION
        ));
    }
    Ok(bincode::deserialize(body)?)
}
