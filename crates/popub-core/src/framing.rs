//! Length-prefixed AEAD packet transport with directional nonces
//! (spec.md §3 "Frame", §4.3).

use crate::error::FramingError;
use crate::nonce::SessionNonce;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// AEAD tag size for XChaCha20-Poly1305.
const TAG_LEN: usize = 16;
/// `2B length block + 16B tag` + `16B tag on the body block`.
pub const PACKET_OVERHEAD: usize = 2 + TAG_LEN + TAG_LEN;
/// 16384 - overhead, i.e. the largest body a single frame can carry.
pub const MAX_BODY_SIZE: usize = 16_384 - PACKET_OVERHEAD;
/// The largest a whole frame can be on the wire.
pub const MAX_PACKET_SIZE: usize = 16_384;

/// One authenticated, encrypted tunnel session: the AEAD keyed by the
/// X25519 shared secret, plus the two directional nonces (spec.md §3
/// "Per-session ephemeral key", "Directional nonces"). The AEAD is behind
/// an `Arc` so `into_halves` can hand each direction its own task without
/// requiring the cipher itself to implement `Clone`.
pub struct Session {
    aead: Arc<XChaCha20Poly1305>,
    send_nonce: SessionNonce,
    recv_nonce: SessionNonce,
}

/// The send half of a split `Session` (spec.md §4.7: the two pipe
/// directions use disjoint nonces and must be independently ownable by
/// their respective tasks).
pub struct SessionWriter {
    aead: Arc<XChaCha20Poly1305>,
    send_nonce: SessionNonce,
}

/// The recv half of a split `Session`.
pub struct SessionReader {
    aead: Arc<XChaCha20Poly1305>,
    recv_nonce: SessionNonce,
}

impl Session {
    /// `session_key` is the raw 32-byte X25519 shared secret, used directly
    /// as the AEAD key (spec.md §4.2: "no HKDF stretch"). `local_to_relay`
    /// selects which directional nonce is `send` versus `recv` for this
    /// side of the session.
    pub fn new(session_key: [u8; 32], local_to_relay: bool) -> Self {
        Self {
            aead: Arc::new(XChaCha20Poly1305::new((&session_key).into())),
            send_nonce: SessionNonce::new(local_to_relay),
            recv_nonce: SessionNonce::new(!local_to_relay),
        }
    }

    /// Split into independent reader/writer halves so the pipe stage
    /// (spec.md §4.7) can own each direction in its own task.
    pub fn into_halves(self) -> (SessionReader, SessionWriter) {
        (
            SessionReader {
                aead: self.aead.clone(),
                recv_nonce: self.recv_nonce,
            },
            SessionWriter {
                aead: self.aead,
                send_nonce: self.send_nonce,
            },
        )
    }

    /// Reassemble a `Session` from a previously split reader/writer pair —
    /// the inverse of `into_halves`, used when a control phase's recv/send
    /// task split (spec.md §4.4 step 2, §9) hands ownership back to the
    /// caller so the pipe stage can take over the whole socket.
    pub fn from_halves(reader: SessionReader, writer: SessionWriter) -> Self {
        Self {
            aead: reader.aead,
            send_nonce: writer.send_nonce,
            recv_nonce: reader.recv_nonce,
        }
    }

    /// Seal and write one frame. `body.len()` must be `<= MAX_BODY_SIZE`;
    /// a caller exceeding that is a programming error (spec.md §4.3), not a
    /// recoverable failure, so it panics rather than returning `Err`.
    pub async fn write_packet<T: AsyncWrite + Unpin + Send>(
        &mut self,
        transport: &mut T,
        body: &[u8],
    ) -> Result<(), FramingError> {
        write_packet(&self.aead, &mut self.send_nonce, transport, body).await
    }

    /// Read one frame, authenticate and decrypt it, and return the
    /// plaintext body borrowed from `buf`. `buf` is reused across calls —
    /// the returned slice is only valid until the next `read_packet` call
    /// on this `buf` (spec.md §4.3).
    pub async fn read_packet<'b, T: AsyncRead + Unpin + Send>(
        &mut self,
        transport: &mut T,
        buf: &'b mut Vec<u8>,
    ) -> Result<&'b [u8], FramingError> {
        read_packet(&self.aead, &mut self.recv_nonce, transport, buf).await
    }
}

impl SessionWriter {
    pub async fn write_packet<T: AsyncWrite + Unpin + Send>(
        &mut self,
        transport: &mut T,
        body: &[u8],
    ) -> Result<(), FramingError> {
        write_packet(&self.aead, &mut self.send_nonce, transport, body).await
    }
}

impl SessionReader {
    pub async fn read_packet<'b, T: AsyncRead + Unpin + Send>(
        &mut self,
        transport: &mut T,
        buf: &'b mut Vec<u8>,
    ) -> Result<&'b [u8], FramingError> {
        read_packet(&self.aead, &mut self.recv_nonce, transport, buf).await
    }
}

async fn write_packet<T: AsyncWrite + Unpin + Send>(
    aead: &XChaCha20Poly1305,
    send_nonce: &mut SessionNonce,
    transport: &mut T,
    body: &[u8],
) -> Result<(), FramingError> {
    assert!(
        body.len() <= MAX_BODY_SIZE,
        "packet body {} exceeds MAX_BODY_SIZE {}",
        body.len(),
        MAX_BODY_SIZE
    );

    let len_bytes = (body.len() as u16).to_be_bytes();
    let len_nonce = send_nonce.as_xnonce();
    let len_sealed = aead
        .encrypt(&len_nonce, len_bytes.as_ref())
        .expect("sealing a fixed 2-byte length block cannot fail");
    send_nonce.increment();

    let body_nonce = send_nonce.as_xnonce();
    let body_sealed = aead
        .encrypt(&body_nonce, body)
        .expect("sealing a bounded-size body cannot fail");
    send_nonce.increment();

    let mut frame = Vec::with_capacity(len_sealed.len() + body_sealed.len());
    frame.extend_from_slice(&len_sealed);
    frame.extend_from_slice(&body_sealed);
    transport.write_all(&frame).await?;
    Ok(())
}

async fn read_packet<'b, T: AsyncRead + Unpin + Send>(
    aead: &XChaCha20Poly1305,
    recv_nonce: &mut SessionNonce,
    transport: &mut T,
    buf: &'b mut Vec<u8>,
) -> Result<&'b [u8], FramingError> {
    let mut len_ct = [0u8; 2 + TAG_LEN];
    transport.read_exact(&mut len_ct).await?;
    let len_nonce = recv_nonce.as_xnonce();
    let len_pt = aead
        .decrypt(&len_nonce, len_ct.as_ref())
        .map_err(|_| FramingError::AeadAuth)?;
    recv_nonce.increment();

    let body_len = u16::from_be_bytes([len_pt[0], len_pt[1]]) as usize;
    if body_len > MAX_BODY_SIZE {
        return Err(FramingError::OversizedLength(body_len));
    }

    let mut body_ct = vec![0u8; body_len + TAG_LEN];
    transport.read_exact(&mut body_ct).await?;
    let body_nonce = recv_nonce.as_xnonce();
    let body_pt = aead
        .decrypt(&body_nonce, body_ct.as_ref())
        .map_err(|_| FramingError::AeadAuth)?;
    recv_nonce.increment();

    buf.clear();
    buf.extend_from_slice(&body_pt);
    Ok(buf.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn paired_sessions() -> (Session, Session) {
        let key = [7u8; 32];
        (Session::new(key, true), Session::new(key, false))
    }

    #[tokio::test]
    async fn roundtrip_various_body_sizes() {
        for len in [0usize, 1, MAX_BODY_SIZE] {
            let (mut a, mut b) = paired_sessions();
            let (mut side_a, mut side_b) = duplex(MAX_PACKET_SIZE * 2);
            let body = vec![0xABu8; len];

            a.write_packet(&mut side_a, &body).await.unwrap();
            let mut buf = Vec::new();
            let recv = b.read_packet(&mut side_b, &mut buf).await.unwrap();
            assert_eq!(recv, body.as_slice());
        }
    }

    #[tokio::test]
    async fn read_packet_rejects_oversized_length() {
        // Forge a length block claiming more than MAX_BODY_SIZE.
        let key = [3u8; 32];
        let mut writer_session = Session::new(key, true);
        let mut reader_session = Session::new(key, false);
        let (mut side_a, mut side_b) = duplex(1024);

        let len_nonce = writer_session.send_nonce.as_xnonce();
        let bogus_len = (MAX_BODY_SIZE + 1) as u16;
        let sealed = writer_session
            .aead
            .encrypt(&len_nonce, bogus_len.to_be_bytes().as_ref())
            .unwrap();
        writer_session.send_nonce.increment();
        tokio::io::AsyncWriteExt::write_all(&mut side_a, &sealed)
            .await
            .unwrap();

        let mut buf = Vec::new();
        let err = reader_session.read_packet(&mut side_b, &mut buf).await;
        assert!(matches!(err, Err(FramingError::OversizedLength(_))));
    }

    #[tokio::test]
    async fn nonce_reuse_across_sessions_fails_auth() {
        let (mut a, _b) = paired_sessions();
        let (_other_a, mut unrelated_b) = paired_sessions();
        let (mut side_a, mut side_b) = duplex(MAX_PACKET_SIZE * 2);

        a.write_packet(&mut side_a, b"hello").await.unwrap();
        let mut buf = Vec::new();
        let result = unrelated_b.read_packet(&mut side_b, &mut buf).await;
        assert!(matches!(result, Err(FramingError::AeadAuth)));
    }
}
