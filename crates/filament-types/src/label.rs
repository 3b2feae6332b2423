//! Switch labels.
//!
//! A switch label is a compact 16-bit handle for a link, so higher layers can
//! address a neighbor without repeating its full overlay address. Label 0 is
//! reserved and never assigned; within one node at most one live link holds a
//! given label.

use std::net::Ipv6Addr;

use rand::Rng;

/// Largest value of the short label range. Short labels encode more compactly
/// on the wire and are preferred for routable peers.
const SHORT_LABEL_MAX: u16 = 0xff;

/// A per-node identifier for one link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwitchLabel(u16);

impl SwitchLabel {
    /// Create a label from its raw value. Zero means "unassigned".
    pub fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    #[inline]
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Whether the label has been assigned.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// Derive the deterministic label for a peer address: the last two
    /// address bytes. Returns `None` when the derivation lands on the
    /// reserved zero label.
    pub fn derive_from_ip(ip: &Ipv6Addr) -> Option<Self> {
        let octets = ip.octets();
        let raw = u16::from_be_bytes([octets[14], octets[15]]);
        (raw != 0).then_some(Self(raw))
    }

    /// Pick a random label from the short range (1..=255).
    pub fn random_short<R: Rng>(rng: &mut R) -> Self {
        Self(rng.gen_range(1..=SHORT_LABEL_MAX))
    }

    /// Pick a random label from the long range (256..=65535).
    pub fn random_long<R: Rng>(rng: &mut R) -> Self {
        Self(rng.gen_range(SHORT_LABEL_MAX + 1..=u16::MAX))
    }
}

impl std::fmt::Display for SwitchLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn derive_uses_last_two_bytes() {
        let ip: Ipv6Addr = "fd00::1:2345".parse().unwrap();
        assert_eq!(SwitchLabel::derive_from_ip(&ip), Some(SwitchLabel::new(0x2345)));
    }

    #[test]
    fn derive_rejects_zero() {
        let ip: Ipv6Addr = "fd00::1:0".parse().unwrap();
        assert_eq!(SwitchLabel::derive_from_ip(&ip), None);
    }

    #[test]
    fn random_labels_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let short = SwitchLabel::random_short(&mut rng);
            assert!((1..=SHORT_LABEL_MAX).contains(&short.raw()));
            let long = SwitchLabel::random_long(&mut rng);
            assert!(long.raw() > SHORT_LABEL_MAX);
        }
    }
}
