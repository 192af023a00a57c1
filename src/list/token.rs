//! Continuation tokens.
//!
//! A token is base64 over a small JSON document:
//!
//! ```text
//! {"v":"chunkd.list/v1","rv":1042,"start":"<base64 key>","inconsistent":true}
//! ```
//!
//! The layout is private to the engine. Callers echo tokens back verbatim; anything that
//! does not parse is rejected here, while staleness of `rv` is left for the store to detect.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TOKEN_VERSION_PREFIX: &str = "chunkd.list/v";
const TOKEN_VERSION: u32 = 1;

/// Why a continuation token could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed continue token: {0}")]
    Malformed(String),

    #[error("continue token version {0:?} is not supported")]
    UnsupportedVersion(String),
}

/// Resume position of a paginated listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinuationToken {
    /// The next page starts strictly after this key.
    pub start_key: Vec<u8>,

    /// Anchor revision of the page sequence.
    pub revision: i64,

    /// Set once the original anchor was compacted and the sequence moved to a newer one.
    pub inconsistent: bool,
}

#[derive(Serialize, Deserialize)]
struct WireToken {
    v: String,
    rv: i64,
    start: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    inconsistent: bool,
}

/// Encodes and decodes continuation tokens.
pub struct ContinuationCodec;

impl ContinuationCodec {
    /// Encodes a token. Deterministic: equal tokens encode to equal strings.
    pub fn encode(token: &ContinuationToken) -> String {
        let wire = WireToken {
            v: format!("{}{}", TOKEN_VERSION_PREFIX, TOKEN_VERSION),
            rv: token.revision,
            start: STANDARD.encode(&token.start_key),
            inconsistent: token.inconsistent,
        };

        let json = serde_json::to_vec(&wire)
            .expect("token document of strings, integers and bools always serializes");
        STANDARD.encode(json)
    }

    /// Decodes a token produced by [`ContinuationCodec::encode`].
    pub fn decode(encoded: &str) -> Result<ContinuationToken, TokenError> {
        let json = STANDARD
            .decode(encoded)
            .map_err(|e| TokenError::Malformed(format!("not valid base64: {}", e)))?;

        let wire: WireToken = serde_json::from_slice(&json)
            .map_err(|e| TokenError::Malformed(format!("not a valid token document: {}", e)))?;

        check_version(&wire.v)?;

        if wire.rv <= 0 {
            return Err(TokenError::Malformed(format!(
                "revision must be positive, got {}",
                wire.rv
            )));
        }

        let start_key = STANDARD
            .decode(&wire.start)
            .map_err(|e| TokenError::Malformed(format!("start key is not valid base64: {}", e)))?;

        Ok(ContinuationToken {
            start_key,
            revision: wire.rv,
            inconsistent: wire.inconsistent,
        })
    }
}

fn check_version(version: &str) -> Result<(), TokenError> {
    let number = version
        .strip_prefix(TOKEN_VERSION_PREFIX)
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| TokenError::Malformed(format!("unknown token version {:?}", version)))?;

    match number {
        TOKEN_VERSION => Ok(()),
        n if n > TOKEN_VERSION => Err(TokenError::UnsupportedVersion(version.to_string())),
        _ => Err(TokenError::Malformed(format!("unknown token version {:?}", version))),
    }
}
