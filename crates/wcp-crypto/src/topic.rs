//! Relay routing identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::sha256;
use crate::keys::SymmetricKey;

/// 32-byte relay routing identifier, hex on the wire and in storage.
///
/// Proposal topics are random; settled topics are derived from the agreed
/// symmetric key so both peers arrive at the same one without exchanging it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic([u8; 32]);

impl Topic {
    /// Random topic for a public rendezvous.
    pub fn generate() -> Self {
        let mut buf = [0u8; 32];
        getrandom::getrandom(&mut buf).ok();
        Topic(buf)
    }

    /// Settled topic: SHA-256 of the symmetric key bytes.
    pub fn from_key(key: &SymmetricKey) -> Self {
        Topic(sha256(key.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}..)", &hex::encode(self.0)[..8])
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid topic: expected 64 hex characters")]
pub struct InvalidTopic;

impl FromStr for Topic {
    type Err = InvalidTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| InvalidTopic)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| InvalidTopic)?;
        Ok(Topic(arr))
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
