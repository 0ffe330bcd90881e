//! Data key identifiers.

use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a data key identifier (a UUID) in bytes.
pub const DATA_KEY_ID_SIZE: usize = 16;

/// BSON binary subtype for UUIDs, used for key vault `_id` values.
pub const UUID_SUBTYPE: &str = "04";

/// Identifier of a key vault entry.
///
/// Displayed and serialized as standard base64, the form operators copy into
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataKeyId([u8; DATA_KEY_ID_SIZE]);

impl DataKeyId {
    /// Generates a fresh random (v4 UUID) identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Creates an identifier from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DATA_KEY_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates an identifier from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the slice is not 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; DATA_KEY_ID_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidArgument(format!(
                "data key id must be {DATA_KEY_ID_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Parses a base64-encoded identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the input is empty, not base64, or
    /// does not decode to 16 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(Error::InvalidArgument("data key id is required".to_string()));
        }
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidArgument(format!("data key id is not valid base64: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Returns the base64 encoding.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DATA_KEY_ID_SIZE] {
        &self.0
    }

    /// Renders the identifier as canonical extended JSON binary (subtype 4).
    #[must_use]
    pub fn to_extended_json(&self) -> serde_json::Value {
        serde_json::json!({ "$binary": { "base64": self.to_base64(), "subType": UUID_SUBTYPE } })
    }

    /// Reads an identifier back from its extended JSON form.
    #[must_use]
    pub fn from_extended_json(value: &serde_json::Value) -> Option<Self> {
        let binary = value.get("$binary")?;
        if binary.get("subType")?.as_str()? != UUID_SUBTYPE {
            return None;
        }
        Self::from_base64(binary.get("base64")?.as_str()?).ok()
    }
}

impl fmt::Display for DataKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for DataKeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl TryFrom<String> for DataKeyId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base64(&value)
    }
}

impl From<DataKeyId> for String {
    fn from(id: DataKeyId) -> Self {
        id.to_base64()
    }
}
