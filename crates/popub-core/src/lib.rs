//! Shared protocol implementation for popub: the reverse-tunnel port
//! forwarder's handshake, framed AEAD transport, PROXY v2 codec, and the
//! pipe stage that both `popub-local` and `popub-relay` drive.

pub mod backoff;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod nonce;
pub mod pipe;
pub mod proxy_v2;
pub mod psk;
pub mod timeouts;
pub mod transport;

pub use backoff::Backoff;
pub use error::{FramingError, HandshakeError, ProxyV2Error};
pub use framing::{Session, SessionReader, SessionWriter, MAX_BODY_SIZE, MAX_PACKET_SIZE};
pub use handshake::{perform_local_handshake, perform_relay_handshake};
pub use nonce::SessionNonce;
pub use pipe::run_pipe;
pub use psk::passphrase_to_psk;
pub use timeouts::Timeouts;
pub use transport::Stream;

/// The control-channel opcodes exchanged once a session's handshake is
/// complete (spec.md §4.5 "Control messages").
pub mod opcode {
    /// Relay -> Local: keepalive ping; Local must reply in kind.
    pub const PING: u8 = 0x00;
    /// Relay -> Local: a public client connected, body is the PROXY v2
    /// header describing it.
    pub const CONN: u8 = 0x0d;

    /// Total size of a control-channel body: one opcode byte plus
    /// [`crate::proxy_v2::BODY_LEN`] bytes of payload/padding (spec.md
    /// §4.4/§4.5: "padded to 254 bytes").
    pub const CONTROL_BODY_LEN: usize = 1 + crate::proxy_v2::BODY_LEN;
}
