use thiserror::Error;

/// Errors from the handshake exchange (spec.md §4.2).
///
/// All variants are fatal to the session: there is no handshake retry at
/// this layer, only at the caller (Local reconnects with backoff, Relay
/// just closes the connection).
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authorization failure")]
    AeadAuth,
    #[error("malformed ephemeral public key")]
    MalformedPoint,
    #[error("random generation failure")]
    Rng,
}

/// Errors from the framed AEAD transport (spec.md §4.3).
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("aead authentication failure")]
    AeadAuth,
    #[error("advertised packet length {0} exceeds max body size")]
    OversizedLength(usize),
}

/// Errors from the PROXY protocol v2 codec (spec.md §4.8).
#[derive(Error, Debug)]
pub enum ProxyV2Error {
    #[error("invalid PROXY v2 protocol header")]
    InvalidHeader,
    #[error("invalid PROXY v2 address")]
    InvalidAddress,
}
