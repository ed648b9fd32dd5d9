use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The offer has no usable `DTLS/SCTP` media section or is missing the
    /// attributes a data-channel answer needs.
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    /// Certificate or private key buffer malformed at endpoint construction.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// FINGERPRINT or MESSAGE-INTEGRITY invalid, or USERNAME mismatch.
    /// Handled locally: the datagram is dropped.
    #[error("stun auth failed: {0}")]
    StunAuthFailed(String),
    /// Primary requested from an empty candidate set.
    #[error("empty candidate set")]
    IceEmpty,
    #[error("dtls handshake: {0}")]
    DtlsHandshake(String),
    #[error("sctp transport: {0}")]
    SctpTransport(String),
    #[error("bad signalling request: {0}")]
    SignallingBadRequest(String),
    #[error("session closed")]
    SessionClosed,
    #[error("address discovery: {0}")]
    Discovery(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("stun: {0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    Other(String),
}
