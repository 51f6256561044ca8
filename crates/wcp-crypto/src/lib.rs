//! Cryptographic primitives for the WCP protocol.
//!
//! This crate covers the narrow seam the protocol core needs: X25519 key
//! agreement, HKDF-SHA256 symmetric key derivation, topic derivation, and
//! authenticated sealing of relay payloads with ChaCha20-Poly1305. Nothing
//! here knows about JSON-RPC or sequence state.

pub mod envelope;
pub mod hash;
pub mod keys;
pub mod topic;

pub use envelope::{open, seal, seal_plain, EnvelopeError};
pub use keys::{derive_symmetric, KeyPair, PublicKey, SymmetricKey};
pub use topic::Topic;
