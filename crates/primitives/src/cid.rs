use std::fmt;
use std::str::FromStr;

use sha2::Digest;
use thiserror::Error;

const BYTES_LEN: usize = 32;

/// Content address of a block: the SHA-256 digest of its bytes.
///
/// Equality is byte-wise over the digest. The textual form is base58; the
/// wire form is the raw 32 bytes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid([u8; BYTES_LEN]);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CidError {
    #[error("expected {BYTES_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid base58: {0}")]
    InvalidBase58(#[from] bs58::decode::Error),
}

impl Cid {
    pub fn hash(data: &[u8]) -> Self {
        Self(sha2::Sha256::digest(data).into())
    }

    pub const fn as_bytes(&self) -> &[u8; BYTES_LEN] {
        &self.0
    }

    /// Binary wire form, as carried in announcement payloads.
    pub fn to_bytes(self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let bytes: [u8; BYTES_LEN] = bytes
            .try_into()
            .map_err(|_| CidError::InvalidLength(bytes.len()))?;

        Ok(Self(bytes))
    }
}

impl From<[u8; BYTES_LEN]> for Cid {
    fn from(bytes: [u8; BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cid").field(&self.to_string()).finish()
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES_LEN];
        match bs58::decode(s).onto(&mut bytes[..]) {
            Ok(len) if len == BYTES_LEN => Ok(Self(bytes)),
            Ok(len) => Err(CidError::InvalidLength(len)),
            Err(err) => Err(err.into()),
        }
    }
}

impl serde::Serialize for Cid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Cid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CidVisitor;

        impl serde::de::Visitor<'_> for CidVisitor {
            type Value = Cid;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a base58 encoded content address")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(CidVisitor)
    }
}
