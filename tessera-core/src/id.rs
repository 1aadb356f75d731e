use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

use crate::error::{Result, StoreError};

/// Width of a record identifier in bytes.
pub const ID_LEN: usize = 64;

/// Replication domain number.
pub type GroupId = u32;

/// 64-byte record identifier, ordered lexicographically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub [u8; ID_LEN]);

impl ObjectId {
    pub const MIN: ObjectId = ObjectId([0u8; ID_LEN]);
    pub const MAX: ObjectId = ObjectId([0xff; ID_LEN]);

    /// Hash an arbitrary key into the ID space.
    ///
    /// SHA-512 output is exactly [`ID_LEN`] bytes; the same transform also
    /// produces record parent checksums.
    pub fn transform(key: &[u8]) -> ObjectId {
        let digest = Sha512::digest(key);
        let mut raw = [0u8; ID_LEN];
        raw.copy_from_slice(&digest);
        ObjectId(raw)
    }

    pub fn from_slice(raw: &[u8]) -> Result<ObjectId> {
        if raw.len() != ID_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "id must be {} bytes, got {}",
                ID_LEN,
                raw.len()
            )));
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(raw);
        Ok(ObjectId(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<ObjectId> {
        let raw = hex::decode(text)
            .map_err(|error| StoreError::InvalidArgument(format!("bad hex id: {}", error)))?;
        ObjectId::from_slice(&raw)
    }

    /// Attach a group tag for addressing a specific replica.
    pub fn in_group(self, group: GroupId) -> AddressedId {
        AddressedId { id: self, group }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl fmt::Display for ObjectId {
    /// Shortened hex form, enough to tell records apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}...", hex::encode(&self.0[..6]))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ObjectId::from_hex(&text).map_err(D::Error::custom)
    }
}

/// An ID addressed at one replica of one replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressedId {
    pub id: ObjectId,
    pub group: GroupId,
}
