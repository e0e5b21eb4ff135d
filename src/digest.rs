use core::fmt;

use serde::{Deserialize, Serialize};
use sha1::Digest as _;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    #[default]
    Blake3,
}

impl HashAlgorithm {
    pub fn digest(self, data: &[u8]) -> Digest {
        match self {
            Self::Sha1 => Digest::from_bytes(&sha1::Sha1::digest(data)),
            Self::Blake3 => Digest::from_bytes(blake3::hash(data).as_bytes()),
        }
    }
}

/// A content fingerprint, stored as lowercase hex.
///
/// This is the same representation object stores report as an `etag`, so a
/// digest read back from a listing or a manifest can be compared directly with
/// one computed locally.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct Digest(String);

impl Digest {
    pub fn from_bytes(hash: &[u8]) -> Self {
        Self(format!("{:x}", base16ct::HexDisplay(hash)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Digest {
    fn from(hex: String) -> Self {
        Self(hex.to_ascii_lowercase())
    }
}

impl From<&str> for Digest {
    fn from(hex: &str) -> Self {
        Self::from(hex.to_string())
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_are_lowercase_hex() {
        let blake3 = HashAlgorithm::Blake3.digest(b"segment");
        assert_eq!(blake3.as_str().len(), 64);
        assert_eq!(blake3.as_str(), blake3::hash(b"segment").to_hex().as_str());

        let sha1 = HashAlgorithm::Sha1.digest(b"abc");
        assert_eq!(sha1.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn parsed_digests_compare_case_insensitively() {
        let local = HashAlgorithm::Sha1.digest(b"abc");
        let remote = Digest::from("A9993E364706816ABA3E25717850C26C9CD0D89D");
        assert_eq!(local, remote);
    }
}
