pub use serde_bencode::Error as BencodeError;
pub use tokio::io::Error as IoError;

use std::fmt;

pub use crate::{disk::WriteError, peer::PeerError, tracker::TrackerError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate level error type, returned by the non-core layers: metainfo
/// parsing, tracker announces and the swarm itself.
///
/// Errors of individual peer sessions are never fatal to the download and are
/// thus only wrapped here when a caller explicitly wants to surface them.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Holds bencode serialization or deserialization related errors.
    Bencode(BencodeError),
    /// The torrent metainfo is not semantically valid (e.g. it has neither
    /// a `length` nor a `files` key).
    InvalidMetainfo,
    /// The torrent's `pieces` field is not a multiple of 20 or its length
    /// doesn't match the download length.
    InvalidPieces,
    /// Writing the downloaded pieces to their files failed.
    Write(WriteError),
    /// The tracker could not be contacted or returned an invalid response.
    Tracker(TrackerError),
    /// A peer session failed.
    Peer(PeerError),
    /// An IO error ocurred.
    Io(IoError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Bencode(e) => write!(f, "{}", e),
            InvalidMetainfo => write!(f, "invalid metainfo"),
            InvalidPieces => write!(f, "invalid pieces"),
            Write(e) => write!(f, "{}", e),
            Tracker(e) => write!(f, "{}", e),
            Peer(e) => write!(f, "{}", e),
            Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            Bencode(e) => Some(e),
            Write(e) => Some(e),
            Tracker(e) => Some(e),
            Peer(e) => Some(e),
            Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<BencodeError> for Error {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}

impl From<PeerError> for Error {
    fn from(e: PeerError) -> Self {
        Self::Peer(e)
    }
}
