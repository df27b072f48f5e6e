use std::{
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::PeerId;

/// The default client id prefix, in the Azureus-style convention
/// (`-<client code><version>-`).
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-SG0100-";

/// A pending block request older than this is requested again.
pub const DEFAULT_MAX_PENDING_DURATION: Duration = Duration::from_secs(5 * 60);

/// The number of peers we ask trackers for by default.
pub const DEFAULT_TRACKER_PEER_COUNT: usize = 50;

/// The download configuration.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The id advertised to peers in the handshake and to trackers.
    pub client_id: PeerId,
    /// The directory in which the torrent's files are created.
    pub download_dir: PathBuf,
    /// How long a block request may stay unanswered before it is re-issued to
    /// a peer that has the piece.
    pub max_pending_duration: Duration,
    /// The number of peers to request from the torrent's tracker. If `None`,
    /// the tracker is not contacted and only the peers given by the user are
    /// used.
    pub tracker_peer_count: Option<usize>,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: default_client_id(),
            download_dir: download_dir.into(),
            max_pending_duration: DEFAULT_MAX_PENDING_DURATION,
            tracker_peer_count: Some(DEFAULT_TRACKER_PEER_COUNT),
        }
    }
}

/// Creates a client id of the client prefix followed by 12 decimal digits
/// derived from the current time.
fn default_client_id() -> PeerId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let digits = format!("{:012}", nanos % 1_000_000_000_000);
    id[8..].copy_from_slice(digits.as_bytes());
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_id() {
        let id = default_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn test_defaults() {
        let conf = Conf::new("/tmp/downloads");
        assert_eq!(conf.download_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(conf.max_pending_duration, Duration::from_secs(300));
        assert_eq!(conf.tracker_peer_count, Some(50));
    }
}
