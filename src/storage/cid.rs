//! Content identifiers
//!
//! A [`Cid`] is the SHA-256 digest of a block's encoded bytes. Two blocks with
//! the same content always share a CID, which is what makes the WAL chain and
//! snapshots tamper-evident.

use super::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Content identifier: SHA-256 over the block bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Hash `bytes` into a CID
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Cid(out)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex digest without the multibase prefix
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }

    /// Parse the `b`-prefixed form produced by `Display`
    pub fn parse(s: &str) -> StorageResult<Self> {
        let hex = s
            .strip_prefix('b')
            .ok_or_else(|| StorageError::InvalidCid(s.to_string()))?;
        if hex.len() != 64 {
            return Err(StorageError::InvalidCid(s.to_string()));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| StorageError::InvalidCid(s.to_string()))?;
            out[i] = u8::from_str_radix(pair, 16).map_err(|_| StorageError::InvalidCid(s.to_string()))?;
        }
        Ok(Cid(out))
    }

    /// Does `bytes` hash to this CID?
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Cid::of(bytes) == *self
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.to_hex())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_cid() {
        let a = Cid::of(b"hello graph");
        let b = Cid::of(b"hello graph");
        let c = Cid::of(b"hello graph!");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_and_parse() {
        let cid = Cid::of(b"block");
        let text = cid.to_string();
        assert!(text.starts_with('b'));
        assert_eq!(text.len(), 65);
        assert_eq!(Cid::parse(&text).unwrap(), cid);
        assert_eq!(text.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Cid::parse("xyz").is_err());
        assert!(Cid::parse("b1234").is_err());
        let bad = format!("b{}", "zz".repeat(32));
        assert!(Cid::parse(&bad).is_err());
    }

    #[test]
    fn test_known_digest() {
        // sha256("") is a well-known constant
        let cid = Cid::of(b"");
        assert_eq!(
            cid.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(cid.matches(b""));
    }
}
