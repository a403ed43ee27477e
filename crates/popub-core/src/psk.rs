//! Pre-shared key derivation (spec.md §4.1).
//!
//! Stretches the operator passphrase into a 32-byte AEAD key with a
//! memory-hard KDF. Pure and deterministic: same passphrase always yields
//! the same key, which is the whole point — both peers must arrive at an
//! identical PSK without ever exchanging it.

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

/// Fixed salt for the PSK derivation. Not a secret — its only job is to
/// separate popub's KDF usage from any other Argon2 invocation sharing the
/// same passphrase, and the wire protocol has no room to negotiate one.
const SALT: &[u8] = b"popub";

const T_COST: u32 = 1;
const M_COST_KIB: u32 = 64 * 1024;
const P_COST: u32 = 4;
const OUTPUT_LEN: usize = 32;

/// Derive the 32-byte pre-shared authentication key from an operator
/// passphrase. Exists for the lifetime of the process; both popub-local and
/// popub-relay call this once at startup from their CLI's `passphrase`
/// argument.
///
/// Argon2 writes its output into a local scratch buffer wrapped in
/// `Zeroizing` so that buffer is wiped the moment this function is done with
/// it; the `[u8; 32]` handed back to the caller is a plain copy, since the
/// PSK itself is long-lived (spec.md §3: "Exists for process lifetime") and
/// both binaries need to copy it into multiple spawned tasks.
#[must_use]
pub fn passphrase_to_psk(passphrase: &str) -> [u8; OUTPUT_LEN] {
    let params = Params::new(M_COST_KIB, T_COST, P_COST, Some(OUTPUT_LEN))
        .expect("fixed Argon2 parameters are always valid");
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut scratch = Zeroizing::new([0u8; OUTPUT_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), SALT, &mut *scratch)
        .expect("Argon2 hash_password_into with fixed-size output cannot fail");
    *scratch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = passphrase_to_psk("hunter2");
        let b = passphrase_to_psk("hunter2");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_inputs_distinct_keys() {
        let a = passphrase_to_psk("hunter2");
        let b = passphrase_to_psk("hunter3");
        assert_ne!(a, b);
    }
}
