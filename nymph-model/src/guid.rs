//! Entity identifiers.
//!
//! A GUID is 12 random bytes, written as 24 lowercase hex characters.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Number of raw bytes in a GUID.
pub const GUID_BYTES: usize = 12;

/// Unique identifier of a persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid([u8; GUID_BYTES]);

impl Guid {
    /// Generates a new random GUID.
    #[must_use]
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Creates a GUID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; GUID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; GUID_BYTES] {
        &self.0
    }

    /// Parses a GUID from its hex form. Upper-case input is accepted.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.len() != GUID_BYTES * 2 {
            return Err(Error::InvalidGuid(s.to_string()));
        }
        let mut bytes = [0u8; GUID_BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidGuid(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns the lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
