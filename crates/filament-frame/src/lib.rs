//! Frame layer of the filament overlay.
//!
//! A [`Frame`] is the unit of the overlay's datagram layer: a view into a
//! pooled byte buffer with reserved head and tail margins, so lower layers
//! can prepend a length prefix and append an authentication tag without
//! copying. The [`FramePool`] recycles the backing buffers.

pub mod frame;
pub mod pool;

pub use frame::{
    FlowControlFlag, Frame, FrameBuilder, FrameError, FrameType, FRAME_HEADER_LEN, FRAME_VERSION,
};
pub use pool::{FramePool, PooledBuf};
