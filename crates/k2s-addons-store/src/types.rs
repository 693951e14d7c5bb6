//! Content digest newtype.
//!
//! Serializes as the plain `sha256:<hex>` string used throughout OCI
//! documents; deserialization rejects anything else so a digest read from an
//! untrusted index can always be turned into a blob path safely.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::ops::Deref;

const ALGORITHM_PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest of an in-memory payload.
    pub fn of(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Digest of everything readable from `reader`, returned with the byte count.
    pub fn of_reader(mut reader: impl Read) -> Result<(Self, u64), std::io::Error> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok((Self::from_hasher(hasher), size))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{ALGORITHM_PREFIX}{}", hex::encode(hasher.finalize())))
    }

    /// Parse and validate a `sha256:<hex>` string.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let valid = s.strip_prefix(ALGORITHM_PREFIX).is_some_and(|hex_part| {
            hex_part.len() == HEX_LEN
                && hex_part
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        });
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(StoreError::InvalidDigest(s.to_owned()))
        }
    }

    /// The hex part, used as the blob file name.
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

impl Deref for Digest {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Digest {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_payload() {
        let d = Digest::of(b"");
        assert_eq!(
            d.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_of_reader_matches_of() {
        let data = vec![7u8; 200_000];
        let (d, size) = Digest::of_reader(data.as_slice()).unwrap();
        assert_eq!(d, Digest::of(&data));
        assert_eq!(size, 200_000);
    }

    #[test]
    fn hex_strips_algorithm() {
        let d = Digest::of(b"abc");
        assert_eq!(d.hex().len(), 64);
        assert!(!d.hex().contains(':'));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Digest::parse("sha256:xyz").is_err());
        assert!(Digest::parse("md5:d41d8cd98f00b204e9800998ecf8427e").is_err());
        assert!(Digest::parse(&format!("sha256:../{}", "a".repeat(61))).is_err());
        assert!(Digest::parse(&format!("sha256:{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn serde_roundtrip_and_validation() {
        let d = Digest::of(b"payload");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"sha256:nothex\"").is_err());
    }
}
