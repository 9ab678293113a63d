//! Content identity: SHA-256 digests in lowercase hex.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{MetainfoError, MetainfoResult};

/// Length of a content digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 content digest identifying one immutable blob.
///
/// The canonical textual form is 64 lowercase hex characters, which is
/// also the file name the store uses for the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Compute the digest of a byte slice.
    #[must_use]
    pub fn compute(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a digest from its 64-character lowercase hex form.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError::InvalidDigest`] when the input is not
    /// exactly 64 lowercase hex characters.
    pub fn from_hex(value: &str) -> MetainfoResult<Self> {
        if value.len() != DIGEST_LEN * 2
            || !value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(MetainfoError::InvalidDigest {
                value: value.to_string(),
            });
        }
        let mut bytes = [0_u8; DIGEST_LEN];
        hex::decode_to_slice(value, &mut bytes).map_err(|_| MetainfoError::InvalidDigest {
            value: value.to_string(),
        })?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, the store-facing blob name.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for Digest {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = MetainfoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_hex(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_vector() {
        // SHA-256 of the empty string.
        let digest = Digest::compute(b"");
        assert_eq!(
            digest.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_round_trip() -> anyhow::Result<()> {
        let digest = Digest::compute(b"blobnet");
        let parsed = Digest::from_hex(&digest.to_hex())?;
        assert_eq!(parsed, digest);
        assert_eq!(parsed.to_string(), digest.to_hex());
        Ok(())
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(Digest::from_hex("abc").is_err());
        assert!(Digest::from_hex(&"Z".repeat(64)).is_err());
        // Uppercase hex is not canonical.
        assert!(Digest::from_hex(&"A".repeat(64)).is_err());
    }
}
