//! The sealed on-wire envelope around a frame.
//!
//! Wire layout of one record:
//!
//! ```text
//! uint16_be total length (including these 2 bytes) || sealed frame || tag
//! ```
//!
//! The length prefix is the authenticated associated data of the seal, so a
//! record cannot be truncated or spliced without failing authentication.
//! Total length must be greater than 3 and at most 65535.

use filament_crypto::{CryptoError, OpenKey, SealKey, SEAL_OVERHEAD};
use thiserror::Error;

/// Offset of the frame inside a link frame: the 2-byte length prefix.
pub const LINK_FRAME_OFFSET: usize = 2;

/// Trailing bytes the seal adds to a frame.
pub const LINK_FRAME_OVERHEAD: usize = SEAL_OVERHEAD;

/// Largest record the 16-bit length prefix can announce.
pub const MAX_LINK_FRAME: usize = u16::MAX as usize;

/// Errors from sealing and unsealing link frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkFrameError {
    /// The buffer is too short to hold a sealed record.
    #[error("buffer of {0} bytes too short for a link frame")]
    ShortBuffer(usize),

    /// The record exceeds the wire limit.
    #[error("link frame of {0} bytes exceeds the wire limit")]
    TooBig(usize),

    /// The announced length disagrees with the record.
    #[error("announced length {announced} does not match record of {actual} bytes")]
    LengthMismatch { announced: usize, actual: usize },

    /// Authentication failed.
    #[error("link frame authentication failed")]
    Auth,

    /// Other cryptographic failure.
    #[error(transparent)]
    Crypto(CryptoError),
}

/// A view over one wire record, sealed or about to be.
pub struct LinkFrame<'a> {
    data: &'a mut [u8],
    data_len: usize,
}

impl<'a> LinkFrame<'a> {
    /// Wrap a record buffer. For sealing, the buffer must be laid out as
    /// `[2 bytes length space][plaintext][SEAL_OVERHEAD bytes tag space]`;
    /// for unsealing it must hold exactly one received record.
    pub fn new(data: &'a mut [u8]) -> Self {
        let data_len = data.len();
        Self { data, data_len }
    }

    /// Encrypt the plaintext region in place and fill in the length prefix
    /// and the authentication tag.
    pub fn seal(&mut self, key: &mut SealKey) -> Result<(), LinkFrameError> {
        let total = self.data.len();
        if total <= LINK_FRAME_OFFSET + LINK_FRAME_OVERHEAD + 1 {
            return Err(LinkFrameError::ShortBuffer(total));
        }
        if total > MAX_LINK_FRAME {
            return Err(LinkFrameError::TooBig(total));
        }

        self.data[..2].copy_from_slice(&(total as u16).to_be_bytes());
        let (prefix, sealed) = self.data.split_at_mut(LINK_FRAME_OFFSET);
        key.seal_in_place(prefix, sealed).map_err(map_crypto)?;
        Ok(())
    }

    /// Verify and decrypt the record in place.
    pub fn unseal(&mut self, key: &mut OpenKey) -> Result<(), LinkFrameError> {
        let total = self.data.len();
        if total <= LINK_FRAME_OFFSET + LINK_FRAME_OVERHEAD + 1 {
            return Err(LinkFrameError::ShortBuffer(total));
        }

        let announced = u16::from_be_bytes([self.data[0], self.data[1]]) as usize;
        if announced != total {
            return Err(LinkFrameError::LengthMismatch {
                announced,
                actual: total,
            });
        }

        let (prefix, sealed) = self.data.split_at_mut(LINK_FRAME_OFFSET);
        let plain = key.open_in_place(prefix, sealed).map_err(map_crypto)?;
        self.data_len = LINK_FRAME_OFFSET + plain;
        Ok(())
    }

    /// The plaintext payload after a successful [`unseal`](Self::unseal),
    /// excluding the length prefix.
    pub fn link_data(&self) -> &[u8] {
        &self.data[LINK_FRAME_OFFSET..self.data_len]
    }
}

fn map_crypto(err: CryptoError) -> LinkFrameError {
    match err {
        CryptoError::Auth => LinkFrameError::Auth,
        other => LinkFrameError::Crypto(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_crypto::EncryptionSession;

    fn sessions() -> (EncryptionSession, EncryptionSession) {
        let secret = [42u8; 32];
        (
            EncryptionSession::derive(&secret, b"salt", true).unwrap(),
            EncryptionSession::derive(&secret, b"salt", false).unwrap(),
        )
    }

    fn record(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; LINK_FRAME_OFFSET];
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&[0u8; LINK_FRAME_OVERHEAD]);
        buf
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let (a, b) = sessions();
        let (mut seal, _) = a.split();
        let (_, mut open) = b.split();

        let payload = b"frame bytes with padding\0\0\0";
        let mut buf = record(payload);
        LinkFrame::new(&mut buf).seal(&mut seal).unwrap();

        let announced = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(announced, buf.len());

        let mut lf = LinkFrame::new(&mut buf);
        lf.unseal(&mut open).unwrap();
        assert_eq!(lf.link_data(), payload);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let (a, b) = sessions();
        let (mut seal, _) = a.split();
        let (_, mut open) = b.split();

        let mut buf = record(b"payload");
        LinkFrame::new(&mut buf).seal(&mut seal).unwrap();
        buf[1] ^= 1;

        assert!(matches!(
            LinkFrame::new(&mut buf).unseal(&mut open),
            Err(LinkFrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn forged_ciphertext_fails_auth() {
        let (a, b) = sessions();
        let (mut seal, _) = a.split();
        let (_, mut open) = b.split();

        let mut buf = record(b"payload");
        LinkFrame::new(&mut buf).seal(&mut seal).unwrap();
        buf[4] ^= 0xff;

        assert_eq!(
            LinkFrame::new(&mut buf).unseal(&mut open),
            Err(LinkFrameError::Auth)
        );
    }

    #[test]
    fn wrong_session_fails_auth() {
        let (a, _) = sessions();
        let (mut seal, _) = a.split();
        let other = EncryptionSession::derive(&[9u8; 32], b"other", false).unwrap();
        let (_, mut open) = other.split();

        let mut buf = record(b"payload");
        LinkFrame::new(&mut buf).seal(&mut seal).unwrap();
        assert_eq!(
            LinkFrame::new(&mut buf).unseal(&mut open),
            Err(LinkFrameError::Auth)
        );
    }

    #[test]
    fn short_buffer_is_rejected() {
        let (a, _) = sessions();
        let (mut seal, _) = a.split();
        let mut buf = vec![0u8; LINK_FRAME_OFFSET + LINK_FRAME_OVERHEAD];
        assert!(matches!(
            LinkFrame::new(&mut buf).seal(&mut seal),
            Err(LinkFrameError::ShortBuffer(_))
        ));
    }

    #[test]
    fn max_size_record_roundtrips() {
        let (a, b) = sessions();
        let (mut seal, _) = a.split();
        let (_, mut open) = b.split();

        let payload = vec![0xabu8; MAX_LINK_FRAME - LINK_FRAME_OFFSET - LINK_FRAME_OVERHEAD];
        let mut buf = record(&payload);
        assert_eq!(buf.len(), MAX_LINK_FRAME);
        LinkFrame::new(&mut buf).seal(&mut seal).unwrap();

        let mut lf = LinkFrame::new(&mut buf);
        lf.unseal(&mut open).unwrap();
        assert_eq!(lf.link_data(), &payload[..]);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let (a, _) = sessions();
        let (mut seal, _) = a.split();
        let mut buf = vec![0u8; MAX_LINK_FRAME + 1];
        assert!(matches!(
            LinkFrame::new(&mut buf).seal(&mut seal),
            Err(LinkFrameError::TooBig(_))
        ));
    }
}
