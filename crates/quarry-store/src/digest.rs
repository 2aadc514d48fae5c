use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Result, StoreError};

const PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

/// Content digest in the form `sha256:<64 lowercase hex chars>`.
///
/// The hex payload is normalized to lowercase on parse; two digests compare
/// equal iff their payloads are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Parse the string form, accepting uppercase hex.
    pub fn parse(input: &str) -> Result<Self> {
        let syntax = |reason: &str| StoreError::DigestSyntax {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        let hex = input
            .strip_prefix(PREFIX)
            .ok_or_else(|| syntax("expected `sha256:` prefix"))?;
        if hex.len() != HEX_LEN {
            return Err(syntax("expected 64 hex characters"));
        }
        if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(syntax("non-hex character in digest"));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// SHA-256 over an in-memory byte sequence.
    pub fn compute(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self {
            hex: hex::encode(digest),
        }
    }

    /// SHA-256 over a streaming reader without materializing the input.
    pub fn compute_stream(mut reader: impl Read) -> Result<Self> {
        const BUF_SIZE: usize = 64 * 1024;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self {
            hex: hex::encode(hasher.finalize()),
        })
    }

    /// Parse `expected` and compare it against the digest of `bytes`.
    pub fn verify(bytes: &[u8], expected: &str) -> Result<bool> {
        let expected = Self::parse(expected)?;
        Ok(Self::compute(bytes) == expected)
    }

    /// The 64-char lowercase hex payload.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First two hex characters, used as the cache shard directory.
    pub fn shard(&self) -> &str {
        &self.hex[..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}
