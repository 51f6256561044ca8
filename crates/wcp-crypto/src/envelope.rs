//! Sealing of relay payloads.
//!
//! A relay message is self-describing: one kind byte, then either the raw
//! payload (pre-settle proposal topics, where no symmetric key exists yet)
//! or a random 12-byte nonce followed by the ChaCha20-Poly1305 ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::keys::SymmetricKey;

const KIND_PLAIN: u8 = 0;
const KIND_SEALED: u8 = 1;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope too short")]
    TooShort,
    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),
    #[error("sealed envelope on a topic without a key")]
    KeyRequired,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| EnvelopeError::EncryptFailed)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ct.len());
    out.push(KIND_SEALED);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Frame `plaintext` unencrypted. Used only on proposal topics whose key
/// agreement has not happened yet.
pub fn seal_plain(plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + plaintext.len());
    out.push(KIND_PLAIN);
    out.extend_from_slice(plaintext);
    out
}

/// Open an envelope, decrypting when it is sealed.
pub fn open(key: Option<&SymmetricKey>, bytes: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let (&kind, rest) = bytes.split_first().ok_or(EnvelopeError::TooShort)?;
    match kind {
        KIND_PLAIN => Ok(rest.to_vec()),
        KIND_SEALED => {
            let key = key.ok_or(EnvelopeError::KeyRequired)?;
            if rest.len() < NONCE_LEN {
                return Err(EnvelopeError::TooShort);
            }
            let (nonce, ct) = rest.split_at(NONCE_LEN);
            let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
            cipher
                .decrypt(Nonce::from_slice(nonce), ct)
                .map_err(|_| EnvelopeError::DecryptFailed)
        }
        other => Err(EnvelopeError::UnknownKind(other)),
    }
}
