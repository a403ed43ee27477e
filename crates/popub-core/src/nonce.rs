//! Directional nonce discipline for the framed AEAD transport (spec.md §3,
//! REDESIGN FLAGS).
//!
//! Each session carries two of these, one per direction. The low bit of the
//! last byte encodes direction (0 = Relay→Local, 1 = Local→Relay) and is
//! never touched after construction — `increment` always adds an even
//! number, so it can never flip.

use chacha20poly1305::XNonce;

const NONCE_LEN: usize = 24;

/// An opaque 24-byte counter nonce for one direction of one session.
///
/// A dedicated type (rather than a bare `[u8; 24]`) exists so the only way
/// to advance it is the carry-preserving `increment`, preventing accidental
/// reuse or an off-by-one stride (spec.md §9 "Nonce discipline").
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionNonce([u8; NONCE_LEN]);

impl SessionNonce {
    /// `local_to_relay` selects which direction this nonce counts for.
    pub fn new(local_to_relay: bool) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        if local_to_relay {
            bytes[NONCE_LEN - 1] = 1;
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn as_xnonce(&self) -> XNonce {
        XNonce::from(self.0)
    }

    /// Add 2 to the nonce, treated as a 192-bit big-endian integer, with
    /// carry propagating from the low 64-bit limb (bytes 16..24) up through
    /// the middle (bytes 8..16) to the high limb (bytes 0..8). The low bit
    /// of the last byte — the direction bit — is preserved because 2 is
    /// even and carries never touch bit 0 of the low limb.
    pub fn increment(&mut self) {
        let mut c0 = u64::from_be_bytes(self.0[0..8].try_into().unwrap());
        let mut c1 = u64::from_be_bytes(self.0[8..16].try_into().unwrap());
        let (c2, carry1) = u64::from_be_bytes(self.0[16..24].try_into().unwrap()).overflowing_add(2);

        let carry2;
        (c1, carry2) = if carry1 { c1.overflowing_add(1) } else { (c1, false) };
        c0 = if carry2 { c0.wrapping_add(1) } else { c0 };

        self.0[0..8].copy_from_slice(&c0.to_be_bytes());
        self.0[8..16].copy_from_slice(&c1.to_be_bytes());
        self.0[16..24].copy_from_slice(&c2.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_bit_set_on_construction() {
        let relay_to_local = SessionNonce::new(false);
        let local_to_relay = SessionNonce::new(true);
        assert_eq!(relay_to_local.as_bytes()[23], 0);
        assert_eq!(local_to_relay.as_bytes()[23], 1);
    }

    #[test]
    fn increment_advances_by_two_and_preserves_direction_bit() {
        let mut n = SessionNonce::new(true);
        n.increment();
        assert_eq!(n.as_bytes()[23], 0b0000_0011);
        n.increment();
        assert_eq!(n.as_bytes()[23], 0b0000_0101);
    }

    #[test]
    fn increment_carries_across_limbs() {
        let mut bytes = [0u8; 24];
        bytes[16..24].copy_from_slice(&u64::MAX.to_be_bytes());
        let mut n = SessionNonce(bytes);
        n.increment();
        assert_eq!(&n.as_bytes()[16..24], &1u64.to_be_bytes());
        assert_eq!(&n.as_bytes()[8..16], &1u64.to_be_bytes());
        assert_eq!(&n.as_bytes()[0..8], &0u64.to_be_bytes());
    }

    #[test]
    fn lockstep_sessions_stay_equal() {
        let mut a = SessionNonce::new(false);
        let mut b = SessionNonce::new(false);
        for _ in 0..1000 {
            a.increment();
            b.increment();
            assert_eq!(a, b);
        }
    }
}
