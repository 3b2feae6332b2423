//! ChaCha20-Poly1305 sessions with per-direction keys.
//!
//! Keys are derived with HKDF-SHA256 from the handshake's ECDH shared secret.
//! Nonces never travel on the wire: each direction keeps a 64-bit counter,
//! and the underlying stream transport guarantees ordering.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Poly1305 tag size appended to every sealed record.
pub const SEAL_OVERHEAD: usize = 16;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Errors from session derivation and record sealing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// HKDF expansion failed.
    #[error("session key derivation failed")]
    KeyDerivation,

    /// Buffer too small to hold a sealed record.
    #[error("buffer too small for sealed record")]
    ShortBuffer,

    /// Sealing failed.
    #[error("seal failed")]
    Seal,

    /// Authentication failed on open.
    #[error("authentication failed")]
    Auth,

    /// The per-direction nonce counter is exhausted.
    #[error("nonce counter exhausted")]
    NonceExhausted,
}

/// The sending half of a session.
pub struct SealKey {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SealKey {
    /// Seal `buf` in place. The buffer must be laid out as
    /// `plaintext || SEAL_OVERHEAD bytes of tag space`; the tag space is
    /// overwritten with the authentication tag.
    pub fn seal_in_place(&mut self, aad: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() < SEAL_OVERHEAD {
            return Err(CryptoError::ShortBuffer);
        }
        let nonce = next_nonce(&mut self.counter)?;
        let split = buf.len() - SEAL_OVERHEAD;
        let (plaintext, tag_space) = buf.split_at_mut(split);

        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, aad, plaintext)
            .map_err(|_| CryptoError::Seal)?;
        tag_space.copy_from_slice(&tag);
        Ok(())
    }
}

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealKey").field("counter", &self.counter).finish()
    }
}

/// The receiving half of a session.
pub struct OpenKey {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl OpenKey {
    /// Verify and decrypt `buf` in place. The buffer must be laid out as
    /// `ciphertext || tag`; returns the plaintext length. The counter only
    /// advances on success, so a forged record cannot desynchronize the
    /// session.
    pub fn open_in_place(&mut self, aad: &[u8], buf: &mut [u8]) -> Result<usize, CryptoError> {
        if buf.len() < SEAL_OVERHEAD {
            return Err(CryptoError::ShortBuffer);
        }
        let nonce = peek_nonce(self.counter)?;
        let split = buf.len() - SEAL_OVERHEAD;
        let (ciphertext, tag) = buf.split_at_mut(split);

        self.cipher
            .decrypt_in_place_detached(&nonce, aad, ciphertext, Tag::from_slice(tag))
            .map_err(|_| CryptoError::Auth)?;
        self.counter += 1;
        Ok(split)
    }
}

impl std::fmt::Debug for OpenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenKey").field("counter", &self.counter).finish()
    }
}

/// A symmetric session bound to one link, both directions.
#[derive(Debug)]
pub struct EncryptionSession {
    seal: SealKey,
    open: OpenKey,
}

impl EncryptionSession {
    /// Derive a session from the handshake's ECDH shared secret.
    ///
    /// Both sides call this with the same secret and salt; `initiator`
    /// selects which of the two derived keys becomes the sending key, so the
    /// directions pair up across the link.
    pub fn derive(shared_secret: &[u8], salt: &[u8], initiator: bool) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);

        let mut init_key = [0u8; KEY_SIZE];
        let mut resp_key = [0u8; KEY_SIZE];
        hk.expand(b"filament link initiator to responder", &mut init_key)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(b"filament link responder to initiator", &mut resp_key)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let (tx, rx) = if initiator {
            (init_key, resp_key)
        } else {
            (resp_key, init_key)
        };

        Ok(Self {
            seal: SealKey {
                cipher: ChaCha20Poly1305::new(Key::from_slice(&tx)),
                counter: 0,
            },
            open: OpenKey {
                cipher: ChaCha20Poly1305::new(Key::from_slice(&rx)),
                counter: 0,
            },
        })
    }

    /// Seal a record in place. See [`SealKey::seal_in_place`].
    pub fn seal_in_place(&mut self, aad: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
        self.seal.seal_in_place(aad, buf)
    }

    /// Open a record in place. See [`OpenKey::open_in_place`].
    pub fn open_in_place(&mut self, aad: &[u8], buf: &mut [u8]) -> Result<usize, CryptoError> {
        self.open.open_in_place(aad, buf)
    }

    /// Split into the per-direction halves for the link's reader and writer.
    pub fn split(self) -> (SealKey, OpenKey) {
        (self.seal, self.open)
    }
}

fn next_nonce(counter: &mut u64) -> Result<Nonce, CryptoError> {
    let nonce = peek_nonce(*counter)?;
    *counter += 1;
    Ok(nonce)
}

fn peek_nonce(counter: u64) -> Result<Nonce, CryptoError> {
    if counter == u64::MAX {
        return Err(CryptoError::NonceExhausted);
    }
    let mut bytes = [0u8; NONCE_SIZE];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Ok(*Nonce::from_slice(&bytes))
}
