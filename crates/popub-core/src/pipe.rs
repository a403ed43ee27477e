//! The pipe stage: two concurrent unidirectional copies that repurpose a
//! control connection as a data tunnel (spec.md §4.7), grounded on
//! `ForwardClearToEncrypted`/`ForwardEncryptedToClear` in
//! `internal/common/common.go`.

use crate::framing::{Session, MAX_BODY_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Read cleartext off `clear`, frame it, and write it to `encrypted` until
/// EOF or error. On EOF, half-closes `encrypted`'s write side and `clear`'s
/// read side — the tunneled protocol's own close handshake, not ours, ends
/// the other direction.
async fn forward_clear_to_encrypted(
    mut clear_read: tokio::net::tcp::OwnedReadHalf,
    mut encrypted_write: tokio::net::tcp::OwnedWriteHalf,
    mut session: crate::framing::SessionWriter,
) {
    let mut buf = vec![0u8; MAX_BODY_SIZE];
    loop {
        let n = match clear_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::warn!("clear->encrypted read error: {err}");
                break;
            }
        };

        if let Err(err) = session.write_packet(&mut encrypted_write, &buf[..n]).await {
            tracing::warn!("clear->encrypted write error: {err}");
            break;
        }
    }
    let _ = encrypted_write.shutdown().await;
    drop(clear_read);
}

/// Read one AEAD frame at a time off `encrypted` and write its body to
/// `clear` until EOF or error. Mirrors `forward_clear_to_encrypted`'s
/// half-close discipline.
async fn forward_encrypted_to_clear(
    mut encrypted_read: tokio::net::tcp::OwnedReadHalf,
    mut clear_write: tokio::net::tcp::OwnedWriteHalf,
    mut session: crate::framing::SessionReader,
) {
    let mut buf = Vec::new();
    loop {
        let body = match session.read_packet(&mut encrypted_read, &mut buf).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("encrypted->clear read error: {err}");
                break;
            }
        };

        if body.is_empty() {
            continue;
        }
        if let Err(err) = clear_write.write_all(body).await {
            tracing::warn!("encrypted->clear write error: {err}");
            break;
        }
    }
    let _ = clear_write.shutdown().await;
    drop(encrypted_read);
}

/// Spawn both pipe directions between `clear` (the dialed upstream service
/// or, on the Relay, the public client) and `encrypted` (the now-repurposed
/// control connection), and return join handles so the caller can observe
/// task panics (spec.md §4.7, §9).
pub fn run_pipe(
    clear: TcpStream,
    encrypted: TcpStream,
    session: Session,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (clear_read, clear_write) = clear.into_split();
    let (encrypted_read, encrypted_write) = encrypted.into_split();
    let (session_reader, session_writer) = session.into_halves();

    let clear_to_encrypted = tokio::spawn(forward_clear_to_encrypted(
        clear_read,
        encrypted_write,
        session_writer,
    ));
    let encrypted_to_clear = tokio::spawn(forward_encrypted_to_clear(
        encrypted_read,
        clear_write,
        session_reader,
    ));

    (clear_to_encrypted, encrypted_to_clear)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn forwards_both_directions_and_half_closes_on_clear_eof() {
        let key = [9u8; 32];
        let (clear_local, mut clear_remote) = loopback_pair().await;
        let (encrypted_local, mut encrypted_remote) = loopback_pair().await;

        let session = Session::new(key, true);
        let (_c2e, _e2c) = run_pipe(clear_local, encrypted_local, session);

        let mut peer_session = Session::new(key, false);

        // clear -> encrypted
        clear_remote.write_all(b"hello upstream").await.unwrap();
        let mut buf = Vec::new();
        let got = peer_session
            .read_packet(&mut encrypted_remote, &mut buf)
            .await
            .unwrap();
        assert_eq!(got, b"hello upstream");

        // encrypted -> clear
        peer_session
            .write_packet(&mut encrypted_remote, b"hello client")
            .await
            .unwrap();
        let mut recv = [0u8; 32];
        let n = clear_remote.read(&mut recv).await.unwrap();
        assert_eq!(&recv[..n], b"hello client");

        // EOF on clear side half-closes the encrypted write direction
        // without tearing down the still-live encrypted->clear direction.
        drop(clear_remote);
        let mut tail = Vec::new();
        let err = peer_session.read_packet(&mut encrypted_remote, &mut tail).await;
        assert!(err.is_err());

        peer_session
            .write_packet(&mut encrypted_remote, b"still alive")
            .await
            .unwrap();
    }
}
