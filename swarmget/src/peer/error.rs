use std::fmt;

pub use tokio::io::Error as IoError;

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Error type returned on failed peer sessions.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from: a failed session only removes that peer
/// from the download.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerError {
    /// The handshake was malformed or was for a different torrent.
    HandshakeFailed(HandshakeError),
    /// A message had a known id but its length or payload was invalid.
    MalformedMessage,
    /// The peer sent a message with an id we don't know.
    UnsupportedMessage(u8),
    /// A transport error (connection refused, reset, timed out, etc).
    Io(std::io::Error),
}

/// The reasons a handshake may be rejected.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HandshakeError {
    /// The protocol string length or the protocol string itself was not that
    /// of the BitTorrent protocol.
    InvalidProtocol,
    /// Peer's torrent info hash did not match ours.
    InvalidInfoHash,
    /// The connection was closed before the full handshake arrived.
    ConnectionClosed,
}

impl fmt::Display for PeerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use PeerError::*;
        match self {
            HandshakeFailed(e) => write!(fmt, "handshake failed: {}", e),
            MalformedMessage => write!(fmt, "malformed message"),
            UnsupportedMessage(id) => {
                write!(fmt, "unsupported message id {}", id)
            }
            Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use HandshakeError::*;
        match self {
            InvalidProtocol => write!(fmt, "invalid protocol"),
            InvalidInfoHash => write!(fmt, "invalid info hash"),
            ConnectionClosed => write!(fmt, "connection closed"),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HandshakeError> for PeerError {
    fn from(e: HandshakeError) -> Self {
        Self::HandshakeFailed(e)
    }
}

impl From<IoError> for PeerError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}
