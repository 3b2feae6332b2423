//! Frame dispatch and the ping multiplexer.

use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use filament_frame::{Frame, FrameError, FrameType};
use filament_peering::{Peering, LINK_FRAME_OFFSET, LINK_FRAME_OVERHEAD};
use filament_types::keys::PrivateKey;

/// How often registered handlers get their `clean` hook invoked.
const CLEAN_INTERVAL: Duration = Duration::from_secs(10);

/// Errors of the ping protocol family.
#[derive(Debug, Error)]
pub enum PingError {
    /// The ping header did not parse.
    #[error("malformed ping header")]
    Header,

    /// No handler is registered for the ping type.
    #[error("unknown ping type {0:?}")]
    UnknownType(String),

    /// A response arrived without a matching request.
    #[error("no state")]
    NoState,

    /// The request payload was not understood.
    #[error("invalid ping pong request")]
    InvalidRequest,

    /// The response payload was not understood.
    #[error("invalid ping pong response")]
    InvalidResponse,

    /// The destination is not a direct peer of this router.
    #[error("peer {0} is not directly linked")]
    PeerNotFound(Ipv6Addr),

    /// The isolation gate blocked the send.
    #[error("isolation gate blocked send to {0}")]
    Isolated(Ipv6Addr),

    /// The router behind a handler is gone.
    #[error("router stopped")]
    RouterStopped,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("payload codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Allocate a fresh random ping ID.
pub fn new_ping_id() -> u64 {
    OsRng.next_u64()
}

/// Header of every frame in the ping family.
///
/// Body layout: `ping_id u64_be | flags u8 | type_len u8 | type | payload`,
/// where flag bit 0 distinguishes a response (`follow_up`) from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingHeader {
    pub ping_id: u64,
    pub follow_up: bool,
    pub ping_type: String,
}

const FLAG_FOLLOW_UP: u8 = 0b0000_0001;

impl PingHeader {
    /// Encode the header followed by the payload.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(10 + self.ping_type.len() + payload.len());
        body.extend_from_slice(&self.ping_id.to_be_bytes());
        body.push(if self.follow_up { FLAG_FOLLOW_UP } else { 0 });
        body.push(self.ping_type.len() as u8);
        body.extend_from_slice(self.ping_type.as_bytes());
        body.extend_from_slice(payload);
        body
    }

    /// Parse a ping frame body into the header and the remaining payload.
    pub fn parse(body: &[u8]) -> Result<(Self, &[u8]), PingError> {
        if body.len() < 10 {
            return Err(PingError::Header);
        }
        let ping_id = u64::from_be_bytes(body[..8].try_into().map_err(|_| PingError::Header)?);
        let follow_up = body[8] & FLAG_FOLLOW_UP != 0;
        let type_len = body[9] as usize;
        if body.len() < 10 + type_len {
            return Err(PingError::Header);
        }
        let ping_type = std::str::from_utf8(&body[10..10 + type_len])
            .map_err(|_| PingError::Header)?
            .to_string();
        Ok((
            Self {
                ping_id,
                follow_up,
                ping_type,
            },
            &body[10 + type_len..],
        ))
    }
}

/// A protocol handler multiplexed by ping type.
#[async_trait]
pub trait PingHandler: Send + Sync {
    /// The ping type string this handler owns.
    fn ping_type(&self) -> &'static str;

    /// Handle one incoming ping frame of this type.
    async fn handle(&self, frame: Frame, header: &PingHeader, data: &[u8])
        -> Result<(), PingError>;

    /// Periodic cleanup of internal state.
    fn clean(&self);
}

/// Consumes frames from the peering layer and dispatches them.
pub struct Router {
    address: Ipv6Addr,
    peering: Arc<Peering>,
    handlers: RwLock<HashMap<&'static str, Arc<dyn PingHandler>>>,
    /// When set, frames may only be sent toward friends.
    isolate: bool,
    friends: HashSet<Ipv6Addr>,
}

impl Router {
    pub fn new(
        identity: &PrivateKey,
        peering: Arc<Peering>,
        isolate: bool,
        friends: HashSet<Ipv6Addr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: filament_types::addr_for_key(&identity.public_key()),
            peering,
            handlers: RwLock::new(HashMap::new()),
            isolate,
            friends,
        })
    }

    /// This router's overlay address.
    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    /// The peering layer this router sits on.
    pub fn peering(&self) -> &Arc<Peering> {
        &self.peering
    }

    /// Register a ping handler under its type string.
    pub fn register_ping_handler(&self, handler: Arc<dyn PingHandler>) {
        self.handlers.write().insert(handler.ping_type(), handler);
    }

    /// Whether the isolation gate lets traffic to `dst` pass.
    pub fn may_send_to(&self, dst: &Ipv6Addr) -> bool {
        !self.isolate || self.friends.contains(dst)
    }

    /// Build and transmit one ping frame toward a directly linked peer.
    pub fn send_ping_msg(
        &self,
        dst: Ipv6Addr,
        ping_id: u64,
        ping_type: &str,
        data: &[u8],
        follow_up: bool,
        priority: bool,
    ) -> Result<(), PingError> {
        if !self.may_send_to(&dst) {
            return Err(PingError::Isolated(dst));
        }
        let link = self
            .peering
            .link_by_peer(&dst)
            .ok_or(PingError::PeerNotFound(dst))?;

        let header = PingHeader {
            ping_id,
            follow_up,
            ping_type: ping_type.to_string(),
        };
        let frame = self.peering.builder().build(
            self.address,
            dst,
            FrameType::Ping,
            &header.encode(data),
            LINK_FRAME_OFFSET,
            LINK_FRAME_OVERHEAD,
        )?;

        if priority {
            link.send_priority(frame);
        } else {
            link.send(frame);
        }
        Ok(())
    }

    /// Run the dispatch loop until the upstream channel closes or the
    /// shutdown signal fires. Invokes every handler's `clean` hook
    /// periodically.
    pub async fn run(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<Frame>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut clean = tokio::time::interval(CLEAN_INTERVAL);
        clean.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => return,
                },
                _ = clean.tick() => {
                    let handlers: Vec<_> = self.handlers.read().values().cloned().collect();
                    for handler in handlers {
                        handler.clean();
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame.frame_type() {
            FrameType::Ping => {
                if let Err(err) = self.handle_ping(frame).await {
                    warn!(err = %err, "ping handling failed");
                }
            }
            FrameType::Data => {
                // Local delivery belongs to the tun layer, which does not
                // exist here; multi-hop forwarding is out of scope.
                debug!(src = %frame.src_ip(), "dropping data frame without local delivery");
            }
            other => {
                debug!(frame_type = ?other, src = %frame.src_ip(), "unexpected frame after setup");
            }
        }
    }

    async fn handle_ping(&self, frame: Frame) -> Result<(), PingError> {
        let (header, payload) = PingHeader::parse(frame.body())?;
        let payload = payload.to_vec();

        let handler = self
            .handlers
            .read()
            .get(header.ping_type.as_str())
            .cloned()
            .ok_or_else(|| PingError::UnknownType(header.ping_type.clone()))?;
        handler.handle(frame, &header, &payload).await
    }
}
