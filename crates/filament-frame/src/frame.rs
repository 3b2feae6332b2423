//! Frame layout and parsing.
//!
//! Wire layout of a frame, all integers big-endian:
//!
//! ```text
//! version u8 | type u8 | flow u8 | ttl u8 | src 16 bytes | dst 16 bytes | body...
//! ```
//!
//! A [`Frame`] does not own its bytes outright; it is a window of `len` bytes
//! starting at `offset` inside a pooled buffer. The space before the offset
//! and after the window are the head and tail margins, available to the link
//! layer for the length prefix and the seal tag.

use std::net::Ipv6Addr;
use std::sync::Arc;

use thiserror::Error;

use filament_types::SwitchLabel;

use crate::pool::{FramePool, PooledBuf};

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const FRAME_HEADER_LEN: usize = 36;

/// Default time-to-live for new frames.
const DEFAULT_TTL: u8 = 64;

/// Errors from frame parsing and margin accounting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Data too short to hold a frame header.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// Unsupported frame version.
    #[error("unsupported frame version {0}")]
    BadVersion(u8),

    /// Unknown frame type byte.
    #[error("unknown frame type {0}")]
    BadType(u8),

    /// The window does not fit inside the backing buffer.
    #[error("frame window out of bounds")]
    OutOfBounds,

    /// The requested margins were not reserved at construction.
    #[error("margins {head},{tail} not available")]
    MarginUnavailable { head: usize, tail: usize },

    /// The frame does not fit the available buffer.
    #[error("frame of {0} bytes too big for buffer")]
    TooBig(usize),
}

/// The kind of payload a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// First handshake message, initiator to responder.
    PeeringHello = 1,
    /// Second handshake message, responder to initiator.
    PeeringResponse = 2,
    /// Third handshake message, initiator to responder.
    PeeringConfirm = 3,
    /// Ping protocol family.
    Ping = 4,
    /// Overlay traffic.
    Data = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Self::PeeringHello),
            2 => Ok(Self::PeeringResponse),
            3 => Ok(Self::PeeringConfirm),
            4 => Ok(Self::Ping),
            5 => Ok(Self::Data),
            other => Err(FrameError::BadType(other)),
        }
    }
}

/// Flow-control pressure hint carried in the frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowControlFlag {
    /// Sender has spare queue capacity.
    #[default]
    IncreaseFlow = 0,
    /// Sender queue is filling, hold the current rate.
    HoldFlow = 1,
    /// Sender queue is under pressure, back off.
    DecreaseFlow = 2,
}

impl FlowControlFlag {
    /// Decode from the header byte. Unknown values read as increase, so an
    /// unaware peer never throttles traffic.
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::HoldFlow,
            2 => Self::DecreaseFlow,
            _ => Self::IncreaseFlow,
        }
    }
}

/// One overlay datagram backed by a pooled buffer.
///
/// Ownership is linear: a frame is produced once, consumed by exactly one
/// downstream, and its buffer returns to the pool when the frame drops.
#[derive(Debug)]
pub struct Frame {
    buf: PooledBuf,
    off: usize,
    len: usize,
    ftype: FrameType,
    recv_label: Option<SwitchLabel>,
}

impl Frame {
    /// Parse a frame window of `len` bytes starting at `off` inside `buf`.
    ///
    /// The bytes stay in place; the same buffer returns to the pool once the
    /// frame is consumed.
    pub fn parse(buf: PooledBuf, off: usize, len: usize) -> Result<Self, FrameError> {
        let end = off.checked_add(len).ok_or(FrameError::OutOfBounds)?;
        if end > buf.len() {
            return Err(FrameError::OutOfBounds);
        }
        if len < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort(len));
        }

        let header = &buf[off..off + FRAME_HEADER_LEN];
        if header[0] != FRAME_VERSION {
            return Err(FrameError::BadVersion(header[0]));
        }
        let ftype = FrameType::try_from(header[1])?;

        Ok(Self {
            buf,
            off,
            len,
            ftype,
            recv_label: None,
        })
    }

    /// Length of the frame window (header plus body).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The frame type.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.ftype
    }

    /// The flow-control hint the sender stamped on this frame.
    pub fn flow_flag(&self) -> FlowControlFlag {
        FlowControlFlag::from_byte(self.buf[self.off + 2])
    }

    /// Stamp the flow-control hint.
    pub fn set_flow_flag(&mut self, flag: FlowControlFlag) {
        self.buf[self.off + 2] = flag as u8;
    }

    /// Remaining time-to-live.
    pub fn ttl(&self) -> u8 {
        self.buf[self.off + 3]
    }

    /// Source overlay address from the header.
    pub fn src_ip(&self) -> Ipv6Addr {
        read_ip(&self.buf[self.off + 4..self.off + 20])
    }

    /// Destination overlay address from the header.
    pub fn dst_ip(&self) -> Ipv6Addr {
        read_ip(&self.buf[self.off + 20..self.off + 36])
    }

    /// Frame body after the fixed header.
    pub fn body(&self) -> &[u8] {
        &self.buf[self.off + FRAME_HEADER_LEN..self.off + self.len]
    }

    /// Switch label of the link this frame arrived on, if any. Replies look
    /// the link up through the registry, which filters closing links.
    pub fn recv_label(&self) -> Option<SwitchLabel> {
        self.recv_label
    }

    /// Record the receiving link's switch label.
    pub fn set_recv_label(&mut self, label: SwitchLabel) {
        self.recv_label = Some(label);
    }

    /// Borrow the frame window widened by the given margins:
    /// `[off - head .. off + len + tail]`.
    ///
    /// Fails if the margins were not reserved when the frame was built.
    pub fn data_with_margins(&mut self, head: usize, tail: usize) -> Result<&mut [u8], FrameError> {
        if head > self.off || self.off + self.len + tail > self.buf.len() {
            return Err(FrameError::MarginUnavailable { head, tail });
        }
        Ok(&mut self.buf[self.off - head..self.off + self.len + tail])
    }
}

fn read_ip(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    Ipv6Addr::from(octets)
}

/// Builds outbound frames on pooled buffers.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    pool: Arc<FramePool>,
}

impl FrameBuilder {
    pub fn new(pool: Arc<FramePool>) -> Self {
        Self { pool }
    }

    /// The pool backing this builder.
    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Get a pooled read buffer of the given size.
    pub fn get_pooled(&self, size: usize) -> PooledBuf {
        self.pool.get(size)
    }

    /// Build a frame around `body`, reserving `head` and `tail` margins for
    /// the link layer.
    pub fn build(
        &self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        ftype: FrameType,
        body: &[u8],
        head: usize,
        tail: usize,
    ) -> Result<Frame, FrameError> {
        let len = FRAME_HEADER_LEN + body.len();
        let total = head + len + tail;
        if total > u16::MAX as usize {
            return Err(FrameError::TooBig(total));
        }

        let mut buf = self.pool.get(total);
        let header = &mut buf[head..head + FRAME_HEADER_LEN];
        header[0] = FRAME_VERSION;
        header[1] = ftype as u8;
        header[2] = FlowControlFlag::default() as u8;
        header[3] = DEFAULT_TTL;
        header[4..20].copy_from_slice(&src.octets());
        header[20..36].copy_from_slice(&dst.octets());
        buf[head + FRAME_HEADER_LEN..head + len].copy_from_slice(body);

        Ok(Frame {
            buf,
            off: head,
            len,
            ftype,
            recv_label: None,
        })
    }
}
