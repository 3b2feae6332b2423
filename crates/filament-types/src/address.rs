//! Overlay address derivation.
//!
//! Every node owns one IPv6 address inside the overlay prefix `fd00::/8`.
//! The address is derived deterministically from the node's Ed25519 public
//! key: byte 0 is the prefix, bytes 1-15 are the leading bytes of the
//! BLAKE2b-512 hash of the key. Two nodes agree on each other's address
//! without any exchange beyond the key itself.

use std::net::Ipv6Addr;

use blake2::{Blake2b512, Digest};

use crate::keys::PublicKey;

/// First byte of every overlay address.
pub const OVERLAY_PREFIX: u8 = 0xfd;

/// Derive the overlay address for a public key.
pub fn addr_for_key(key: &PublicKey) -> Ipv6Addr {
    let digest = Blake2b512::digest(key.as_bytes());

    let mut octets = [0u8; 16];
    octets[0] = OVERLAY_PREFIX;
    octets[1..].copy_from_slice(&digest[..15]);
    Ipv6Addr::from(octets)
}

/// Whether an address lies inside the overlay prefix.
pub fn is_overlay_addr(ip: &Ipv6Addr) -> bool {
    ip.octets()[0] == OVERLAY_PREFIX
}

/// Whether an address lies inside the routable overlay range.
///
/// Routable addresses are eligible for short switch labels; everything else
/// falls back to the long label range.
pub fn is_routable_addr(ip: &Ipv6Addr) -> bool {
    is_overlay_addr(ip)
}
