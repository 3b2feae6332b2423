//! The three-message peering handshake.
//!
//! Message flow, all frames unencrypted because the session does not exist
//! yet:
//!
//! ```text
//! initiator                                   responder
//!     | -- PeeringHello (key, eph, nonce, sig) -> |
//!     | <- PeeringResponse (key, eph, nonce, sig) |
//!     | -- PeeringConfirm (sig over transcript) ->|
//! ```
//!
//! Both sides sign with their Ed25519 identity and derive the symmetric
//! session from an ephemeral X25519 exchange, so a peer proves ownership of
//! the key its overlay address is derived from. The state machine is pure:
//! it consumes frames and yields frames, and the I/O driver around it is
//! free to apply its own deadline.

use std::net::Ipv6Addr;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as EphemeralPublic};

use filament_crypto::{CryptoError, EncryptionSession};
use filament_frame::{Frame, FrameBuilder, FrameError, FrameType};
use filament_types::{addr_for_key, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use filament_types::keys::PrivateKey;

use crate::link_frame::LINK_FRAME_OFFSET;

/// Version byte of the setup messages.
const SETUP_VERSION: u8 = 1;

const NONCE_LEN: usize = 16;
const HELLO_LEN: usize = 1 + PUBLIC_KEY_SIZE + 32 + NONCE_LEN + SIGNATURE_SIZE;
const RESPONSE_LEN: usize = PUBLIC_KEY_SIZE + 32 + NONCE_LEN + SIGNATURE_SIZE;

const HELLO_CONTEXT: &[u8] = b"filament peering hello";
const RESPONSE_CONTEXT: &[u8] = b"filament peering response";
const CONFIRM_CONTEXT: &[u8] = b"filament peering confirm";

/// Reasons a peering setup fails.
#[derive(Debug, Error)]
pub enum SetupErrorKind {
    /// A message arrived that the current state cannot accept.
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(FrameType),

    /// A setup message did not parse.
    #[error("malformed setup message")]
    Malformed,

    /// The peer speaks an unknown setup version.
    #[error("unsupported peering version {0}")]
    BadVersion(u8),

    /// An identity signature did not verify.
    #[error("peer signature invalid")]
    BadSignature,

    /// The peer presented our own identity key.
    #[error("connected to self")]
    ConnectedToSelf,

    /// The message ceiling was exceeded.
    #[error("too much setup")]
    TooMuchSetup,

    /// `finalize` was called before the exchange completed.
    #[error("setup incomplete")]
    Incomplete,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A failed setup step. May carry a response frame that should be written to
/// the peer as best effort before the failure is propagated.
#[derive(Debug)]
pub struct SetupError {
    pub kind: SetupErrorKind,
    pub response: Option<Frame>,
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<SetupErrorKind> for SetupError {
    fn from(kind: SetupErrorKind) -> Self {
        Self {
            kind,
            response: None,
        }
    }
}

impl From<CryptoError> for SetupError {
    fn from(err: CryptoError) -> Self {
        SetupErrorKind::from(err).into()
    }
}

impl From<FrameError> for SetupError {
    fn from(err: FrameError) -> Self {
        SetupErrorKind::from(err).into()
    }
}

/// Outcome of one successful setup step.
#[derive(Debug)]
pub struct SetupStep {
    /// Frame to send back, if any.
    pub response: Option<Frame>,
    /// Whether the exchange is complete on this side.
    pub done: bool,
}

/// The yield of a completed handshake.
#[derive(Debug)]
pub struct SetupResult {
    /// Symmetric session for the link.
    pub session: EncryptionSession,
    /// Verified identity of the peer.
    pub peer_key: PublicKey,
    /// Overlay address derived from the peer identity.
    pub peer_ip: Ipv6Addr,
}

enum State {
    AwaitResponse {
        eph: EphemeralSecret,
        nonce: [u8; NONCE_LEN],
        hello_body: Vec<u8>,
    },
    AwaitHello,
    AwaitConfirm {
        session: EncryptionSession,
        peer_key: PublicKey,
        transcript: [u8; 32],
    },
    Complete {
        session: EncryptionSession,
        peer_key: PublicKey,
    },
    Failed,
}

/// State machine of one peering setup.
pub struct PeeringSetup {
    identity: PrivateKey,
    builder: FrameBuilder,
    state: State,
}

impl PeeringSetup {
    /// Start a setup as the initiator. Returns the state machine and the
    /// hello frame to write first.
    pub fn initiate(
        identity: PrivateKey,
        builder: FrameBuilder,
    ) -> Result<(Self, Frame), SetupError> {
        let eph = EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = EphemeralPublic::from(&eph);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut body = Vec::with_capacity(HELLO_LEN);
        body.push(SETUP_VERSION);
        body.extend_from_slice(identity.public_key().as_bytes());
        body.extend_from_slice(eph_pub.as_bytes());
        body.extend_from_slice(&nonce);
        let sig = identity.sign(&signed(HELLO_CONTEXT, &[], &body));
        body.extend_from_slice(sig.as_bytes());

        let src = addr_for_key(&identity.public_key());
        let frame = builder.build(
            src,
            Ipv6Addr::UNSPECIFIED,
            FrameType::PeeringHello,
            &body,
            LINK_FRAME_OFFSET,
            0,
        )?;

        let setup = Self {
            identity,
            builder,
            state: State::AwaitResponse {
                eph,
                nonce,
                hello_body: body,
            },
        };
        Ok((setup, frame))
    }

    /// Start a setup as the responder, waiting for the peer's hello.
    pub fn respond(identity: PrivateKey, builder: FrameBuilder) -> Self {
        Self {
            identity,
            builder,
            state: State::AwaitHello,
        }
    }

    /// Feed one received setup frame into the state machine.
    pub fn handle(&mut self, frame: Frame) -> Result<SetupStep, SetupError> {
        let state = std::mem::replace(&mut self.state, State::Failed);
        match (state, frame.frame_type()) {
            (State::AwaitHello, FrameType::PeeringHello) => self.handle_hello(frame),
            (State::AwaitResponse { eph, nonce, hello_body }, FrameType::PeeringResponse) => {
                self.handle_response(frame, eph, nonce, hello_body)
            }
            (
                State::AwaitConfirm {
                    session,
                    peer_key,
                    transcript,
                },
                FrameType::PeeringConfirm,
            ) => self.handle_confirm(frame, session, peer_key, transcript),
            (_, other) => Err(SetupErrorKind::UnexpectedMessage(other).into()),
        }
    }

    /// Yield the session and the peer's verified identity after the exchange
    /// completed.
    pub fn finalize(self) -> Result<SetupResult, SetupError> {
        match self.state {
            State::Complete { session, peer_key } => Ok(SetupResult {
                session,
                peer_ip: addr_for_key(&peer_key),
                peer_key,
            }),
            _ => Err(SetupErrorKind::Incomplete.into()),
        }
    }

    fn handle_hello(&mut self, frame: Frame) -> Result<SetupStep, SetupError> {
        let hello = frame.body();
        if hello.len() != HELLO_LEN {
            return Err(SetupErrorKind::Malformed.into());
        }
        if hello[0] != SETUP_VERSION {
            // Tell the peer why it is being rejected, as best effort.
            return Err(SetupError {
                kind: SetupErrorKind::BadVersion(hello[0]),
                response: self.rejection_frame(),
            });
        }

        let peer_key = PublicKey::from_bytes(&hello[1..1 + PUBLIC_KEY_SIZE])
            .map_err(|_| SetupErrorKind::Malformed)?;
        if peer_key == self.identity.public_key() {
            return Err(SetupErrorKind::ConnectedToSelf.into());
        }
        let peer_eph = eph_from_slice(&hello[33..65]);
        let peer_nonce = &hello[65..81];
        let sig = Signature::from_slice(&hello[81..]).map_err(|_| SetupErrorKind::Malformed)?;
        peer_key
            .verify(&signed(HELLO_CONTEXT, &[], &hello[..81]), &sig)
            .map_err(|_| SetupErrorKind::BadSignature)?;

        // Build our half of the exchange.
        let eph = EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = EphemeralPublic::from(&eph);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let hello_digest = Sha256::digest(hello);
        let mut body = Vec::with_capacity(RESPONSE_LEN);
        body.extend_from_slice(self.identity.public_key().as_bytes());
        body.extend_from_slice(eph_pub.as_bytes());
        body.extend_from_slice(&nonce);
        let sig = self
            .identity
            .sign(&signed(RESPONSE_CONTEXT, &hello_digest, &body));
        body.extend_from_slice(sig.as_bytes());

        // The session exists on this side from here on; the confirm message
        // proves the initiator reached the same keys.
        let shared = eph.diffie_hellman(&peer_eph);
        let salt = session_salt(peer_nonce, &nonce);
        let session = EncryptionSession::derive(shared.as_bytes(), &salt, false)?;

        let mut transcript_input = Vec::with_capacity(HELLO_LEN + RESPONSE_LEN);
        transcript_input.extend_from_slice(hello);
        transcript_input.extend_from_slice(&body);
        let transcript: [u8; 32] = Sha256::digest(&transcript_input).into();

        let response = self.builder.build(
            addr_for_key(&self.identity.public_key()),
            addr_for_key(&peer_key),
            FrameType::PeeringResponse,
            &body,
            LINK_FRAME_OFFSET,
            0,
        )?;

        self.state = State::AwaitConfirm {
            session,
            peer_key,
            transcript,
        };
        Ok(SetupStep {
            response: Some(response),
            done: false,
        })
    }

    fn handle_response(
        &mut self,
        frame: Frame,
        eph: EphemeralSecret,
        nonce: [u8; NONCE_LEN],
        hello_body: Vec<u8>,
    ) -> Result<SetupStep, SetupError> {
        let response = frame.body();
        if response.len() != RESPONSE_LEN {
            return Err(SetupErrorKind::Malformed.into());
        }

        let peer_key = PublicKey::from_bytes(&response[..PUBLIC_KEY_SIZE])
            .map_err(|_| SetupErrorKind::Malformed)?;
        if peer_key == self.identity.public_key() {
            return Err(SetupErrorKind::ConnectedToSelf.into());
        }
        let peer_eph = eph_from_slice(&response[32..64]);
        let peer_nonce = &response[64..80];
        let sig = Signature::from_slice(&response[80..]).map_err(|_| SetupErrorKind::Malformed)?;

        let hello_digest = Sha256::digest(&hello_body);
        peer_key
            .verify(
                &signed(RESPONSE_CONTEXT, &hello_digest, &response[..80]),
                &sig,
            )
            .map_err(|_| SetupErrorKind::BadSignature)?;

        let shared = eph.diffie_hellman(&peer_eph);
        let salt = session_salt(&nonce, peer_nonce);
        let session = EncryptionSession::derive(shared.as_bytes(), &salt, true)?;

        let mut transcript_input = Vec::with_capacity(HELLO_LEN + RESPONSE_LEN);
        transcript_input.extend_from_slice(&hello_body);
        transcript_input.extend_from_slice(response);
        let transcript: [u8; 32] = Sha256::digest(&transcript_input).into();

        let confirm_sig = self.identity.sign(&signed(CONFIRM_CONTEXT, &transcript, &[]));
        let confirm = self.builder.build(
            addr_for_key(&self.identity.public_key()),
            addr_for_key(&peer_key),
            FrameType::PeeringConfirm,
            confirm_sig.as_bytes(),
            LINK_FRAME_OFFSET,
            0,
        )?;

        self.state = State::Complete { session, peer_key };
        Ok(SetupStep {
            response: Some(confirm),
            done: true,
        })
    }

    fn handle_confirm(
        &mut self,
        frame: Frame,
        session: EncryptionSession,
        peer_key: PublicKey,
        transcript: [u8; 32],
    ) -> Result<SetupStep, SetupError> {
        let body = frame.body();
        let sig = Signature::from_slice(body).map_err(|_| SetupErrorKind::Malformed)?;
        peer_key
            .verify(&signed(CONFIRM_CONTEXT, &transcript, &[]), &sig)
            .map_err(|_| SetupErrorKind::BadSignature)?;

        self.state = State::Complete { session, peer_key };
        Ok(SetupStep {
            response: None,
            done: true,
        })
    }

    fn rejection_frame(&self) -> Option<Frame> {
        self.builder
            .build(
                addr_for_key(&self.identity.public_key()),
                Ipv6Addr::UNSPECIFIED,
                FrameType::PeeringResponse,
                &[],
                LINK_FRAME_OFFSET,
                0,
            )
            .ok()
    }
}

fn signed(context: &[u8], digest: &[u8], body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(context.len() + digest.len() + body.len());
    msg.extend_from_slice(context);
    msg.extend_from_slice(digest);
    msg.extend_from_slice(body);
    msg
}

fn session_salt(initiator_nonce: &[u8], responder_nonce: &[u8]) -> Vec<u8> {
    let mut salt = Vec::with_capacity(2 * NONCE_LEN);
    salt.extend_from_slice(initiator_nonce);
    salt.extend_from_slice(responder_nonce);
    salt
}

fn eph_from_slice(bytes: &[u8]) -> EphemeralPublic {
    let mut arr = [0u8; 32];
    arr.copy_from_slice(bytes);
    EphemeralPublic::from(arr)
}
