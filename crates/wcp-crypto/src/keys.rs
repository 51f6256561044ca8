//! X25519 key agreement and symmetric key derivation.

use std::fmt;
use std::str::FromStr;

use hkdf::Hkdf;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF expansion label binding derived keys to this protocol version.
const KEY_INFO: &[u8] = b"wcp_sym_v2";

/// X25519 public key, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &hex::encode(self.0)[..8])
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid public key: expected 64 hex characters")]
pub struct InvalidPublicKey;

impl FromStr for PublicKey {
    type Err = InvalidPublicKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| InvalidPublicKey)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| InvalidPublicKey)?;
        Ok(PublicKey(arr))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ephemeral keypair generated per proposal.
///
/// Backed by a `StaticSecret` rather than `EphemeralSecret` because the
/// secret must survive until the peer's response arrives, which may be
/// several round trips later.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        f.debug_struct("KeyPair").field("public", &self.public).finish()
    }
}

// Pending proposals outlive the process, so their keypairs persist alongside
// the records. The store already holds derived symmetric keys; the secret
// scalar is no more sensitive than those.
impl Serialize for KeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.secret.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        let secret = StaticSecret::from(arr);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Ok(Self { secret, public })
    }
}

/// 32-byte symmetric key bound to a settled topic. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SymmetricKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl Serialize for SymmetricKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(SymmetricKey(arr))
    }
}

/// Derive the shared symmetric key from our secret and the peer's public key.
///
/// HKDF-SHA256 over the raw X25519 shared secret; both sides derive the
/// identical key, and the settled topic follows from it.
pub fn derive_symmetric(local: &KeyPair, peer: &PublicKey) -> SymmetricKey {
    let shared = local.secret.diffie_hellman(&X25519Public::from(*peer.as_bytes()));
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut out = [0u8; 32];
    // Output length equals the digest size, so expand cannot fail.
    hk.expand(KEY_INFO, &mut out).ok();
    SymmetricKey(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Topic;

    #[test]
    fn agreement_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let ab = derive_symmetric(&a, &b.public_key());
        let ba = derive_symmetric(&b, &a.public_key());
        assert_eq!(ab, ba);
        assert_eq!(Topic::from_key(&ab), Topic::from_key(&ba));
    }

    #[test]
    fn distinct_pairs_distinct_keys() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let c = KeyPair::generate();

        assert_ne!(
            derive_symmetric(&a, &b.public_key()),
            derive_symmetric(&a, &c.public_key())
        );
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let kp = KeyPair::generate();
        let parsed: PublicKey = kp.public_key().to_string().parse().unwrap();
        assert_eq!(parsed, kp.public_key());
    }

    #[test]
    fn keypair_survives_persistence() {
        let kp = KeyPair::generate();
        let json = serde_json::to_string(&kp).unwrap();
        let back: KeyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back.public_key(), kp.public_key());

        let peer = KeyPair::generate();
        assert_eq!(
            derive_symmetric(&kp, &peer.public_key()),
            derive_symmetric(&back, &peer.public_key())
        );
    }
}
