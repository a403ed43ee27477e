//! Generic "connected byte stream" abstraction.
//!
//! spec.md §1 treats the TCP listener/dialer primitives as an opaque
//! transport providing half-close, read/write deadlines, and address
//! introspection; this trait is how the handshake and framing layers stay
//! generic over that transport instead of hard-coding `TcpStream`.

use tokio::io::{AsyncRead, AsyncWrite};

/// A trait object combining `AsyncRead + AsyncWrite + Unpin + Send`. A
/// dedicated trait avoids the "multiple non-auto traits" restriction on
/// trait objects.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}
