//! Mutual-authentication handshake: PSK-keyed AEAD protecting an ephemeral
//! X25519 public key (spec.md §4.2).
//!
//! Grounded on `openshare-core::handshake`'s initiator/responder split, with
//! the length-prefixed record there replaced by the fixed-size 256-byte
//! record spec.md mandates, and the AAD binding from spec.md §4.2 bullet 2
//! added: the second record authenticates under the first record's nonce as
//! associated data, so a replayed or reordered second message never
//! verifies against a different first message.

use crate::error::HandshakeError;
use crate::framing::Session;
use crate::transport::Stream;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey};

const PUBKEY_LEN: usize = 32;
const PADDING_LEN: usize = 184;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
/// Total on-wire size of one handshake record (spec.md §3 "Handshake
/// record"): nonce + (pubkey + padding) + tag.
pub const HANDSHAKE_RECORD_LEN: usize = NONCE_LEN + PUBKEY_LEN + PADDING_LEN + TAG_LEN;

async fn write_handshake_record<T: Stream>(
    transport: &mut T,
    psk: &[u8; 32],
    pubkey: &PublicKey,
    aad: &[u8],
) -> Result<[u8; NONCE_LEN], HandshakeError> {
    let aead = XChaCha20Poly1305::new(psk.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let mut plaintext = Vec::with_capacity(PUBKEY_LEN + PADDING_LEN);
    plaintext.extend_from_slice(pubkey.as_bytes());
    let mut padding = [0u8; PADDING_LEN];
    OsRng.fill_bytes(&mut padding);
    plaintext.extend_from_slice(&padding);

    let ciphertext = aead
        .encrypt(&nonce, Payload { msg: &plaintext, aad })
        .map_err(|_| HandshakeError::AeadAuth)?;

    let mut record = Vec::with_capacity(HANDSHAKE_RECORD_LEN);
    record.extend_from_slice(&nonce_bytes);
    record.extend_from_slice(&ciphertext);
    debug_assert_eq!(record.len(), HANDSHAKE_RECORD_LEN);
    transport.write_all(&record).await?;

    Ok(nonce_bytes)
}

async fn read_handshake_record<T: Stream>(
    transport: &mut T,
    psk: &[u8; 32],
    aad: &[u8],
) -> Result<(PublicKey, [u8; NONCE_LEN]), HandshakeError> {
    let aead = XChaCha20Poly1305::new(psk.into());

    let mut record = [0u8; HANDSHAKE_RECORD_LEN];
    transport.read_exact(&mut record).await?;

    let nonce_bytes: [u8; NONCE_LEN] = record[..NONCE_LEN].try_into().unwrap();
    let nonce = XNonce::from(nonce_bytes);
    let ciphertext = &record[NONCE_LEN..];

    let plaintext = aead
        .decrypt(&nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| HandshakeError::AeadAuth)?;

    let pubkey_bytes: [u8; PUBKEY_LEN] = plaintext[..PUBKEY_LEN].try_into().unwrap();
    if pubkey_bytes == [0u8; PUBKEY_LEN] {
        // The all-zero encoding is the canonical low-order X25519 point;
        // reject it rather than deriving a degenerate shared secret.
        return Err(HandshakeError::MalformedPoint);
    }

    tracing::debug!(
        peer_fingerprint = %hex::encode(&pubkey_bytes[..4]),
        "handshake record verified"
    );
    Ok((PublicKey::from(pubkey_bytes), nonce_bytes))
}

/// Local's side of the handshake (spec.md §4.2, §4.5 step 2): sends first,
/// with no AAD to bind to yet; verifies the Relay's reply bound to the
/// nonce Local just sent.
pub async fn perform_local_handshake<T: Stream>(
    transport: &mut T,
    psk: &[u8; 32],
) -> Result<Session, HandshakeError> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let sent_nonce = write_handshake_record(transport, psk, &public, &[]).await?;
    let (peer_public, _peer_nonce) = read_handshake_record(transport, psk, &sent_nonce).await?;

    let shared = secret.diffie_hellman(&peer_public);
    Ok(Session::new(*shared.as_bytes(), true))
}

/// Relay's side of the handshake (spec.md §4.2, §4.4 step 1): verifies
/// Local's first record (no AAD expected), then replies binding its own
/// record to the nonce it just received.
pub async fn perform_relay_handshake<T: Stream>(
    transport: &mut T,
    psk: &[u8; 32],
) -> Result<Session, HandshakeError> {
    let (peer_public, peer_nonce) = read_handshake_record(transport, psk, &[]).await?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    write_handshake_record(transport, psk, &public, &peer_nonce).await?;

    let shared = secret.diffie_hellman(&peer_public);
    Ok(Session::new(*shared.as_bytes(), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psk::passphrase_to_psk;
    use tokio::io::duplex;

    #[tokio::test]
    async fn local_and_relay_derive_matching_sessions() {
        let psk = passphrase_to_psk("hunter2");
        let (mut local_side, mut relay_side) = duplex(HANDSHAKE_RECORD_LEN * 2);

        let (local_result, relay_result) = tokio::join!(
            perform_local_handshake(&mut local_side, &psk),
            perform_relay_handshake(&mut relay_side, &psk),
        );

        let mut local_session = local_result.unwrap();
        let mut relay_session = relay_result.unwrap();

        // If both sides derived the same key, a frame encrypted by one
        // decrypts cleanly on the other.
        let (mut wire_a, mut wire_b) = duplex(4096);
        local_session
            .write_packet(&mut wire_a, b"ping")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let got = relay_session
            .read_packet(&mut wire_b, &mut buf)
            .await
            .unwrap();
        assert_eq!(got, b"ping");
    }

    #[tokio::test]
    async fn mismatched_passphrase_fails_relay_auth() {
        let local_psk = passphrase_to_psk("hunter2");
        let relay_psk = passphrase_to_psk("different");
        let (mut local_side, mut relay_side) = duplex(HANDSHAKE_RECORD_LEN * 2);

        // The relay task owns its half so it drops (closing the duplex) as
        // soon as it returns, unblocking Local's pending read instead of
        // deadlocking on a reply that never comes.
        let relay_task = tokio::spawn(async move {
            perform_relay_handshake(&mut relay_side, &relay_psk).await
        });
        let _local_result = perform_local_handshake(&mut local_side, &local_psk).await;
        let relay_result = relay_task.await.unwrap();

        assert!(matches!(relay_result, Err(HandshakeError::AeadAuth)));
    }
}
