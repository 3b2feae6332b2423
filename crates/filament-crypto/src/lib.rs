//! Symmetric link encryption for the filament overlay.
//!
//! The peering handshake derives one [`EncryptionSession`] per link. The
//! session holds independent keys and nonce counters per direction, so the
//! link's reader and writer can run concurrently after splitting it.

pub mod session;

pub use session::{CryptoError, EncryptionSession, OpenKey, SealKey, SEAL_OVERHEAD};
