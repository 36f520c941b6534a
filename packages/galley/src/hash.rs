//! Workflow identity hashing.

use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The identity of a workflow: a blake3 digest of its canonical description.
///
/// Two workflows with the same identity are interchangeable; the store is
/// keyed on this value. The hex rendering is used everywhere an identity
/// appears on disk (cache entries, history files, captured output).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct Id([u8; 32]);

impl Id {
    /// View the identity as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Attempt to parse an identity from a hex string.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        let len = bytes.len();
        if len != 32 {
            bail!("invalid identity length: expected 32 bytes, got {len}");
        }
        let mut id = [0; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }

    /// View the identity as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hash the contents of a buffer to create an identity.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer.as_ref());
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash the contents of the iterator in order.
    ///
    /// Fields are digested back to back; callers are responsible for
    /// making the concatenation unambiguous (the canonical description
    /// encoding used by the workflow layer is self-delimiting).
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_ref());
        }
        Self(*hasher.finalize().as_bytes())
    }
}

impl From<&Id> for Id {
    fn from(id: &Id) -> Self {
        id.clone()
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}
