//! Shared types for the filament overlay network.
//!
//! This crate holds the node identity keys, the overlay address derivation,
//! switch labels and peering URLs. It is dependency-light so every other
//! crate in the workspace can use it.

pub mod address;
pub mod keys;
pub mod label;
pub mod peering_url;

pub use address::{addr_for_key, is_overlay_addr, is_routable_addr, OVERLAY_PREFIX};
pub use keys::{KeyError, PrivateKey, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use label::SwitchLabel;
pub use peering_url::{PeeringUrl, PeeringUrlError};
