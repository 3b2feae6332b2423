//! Link layer of the filament overlay.
//!
//! This crate owns everything between the byte stream and the router: the
//! sealed [`LinkFrame`] envelope, the three-message peering handshake, the
//! per-peer [`LinkBase`] with its reader and writer workers, and the
//! [`Peering`] registry that tracks live links by peer address and switch
//! label.

pub mod link;
pub mod link_frame;
pub mod peering;
pub mod setup;

pub use link::{LinkBase, LinkError, SEND_QUEUE_PRIO, SEND_QUEUE_REGULAR};
pub use link_frame::{
    LinkFrame, LinkFrameError, LINK_FRAME_OFFSET, LINK_FRAME_OVERHEAD, MAX_LINK_FRAME,
};
pub use peering::{Peering, PeeringError};
pub use setup::{PeeringSetup, SetupError, SetupErrorKind, SetupResult, SetupStep};
