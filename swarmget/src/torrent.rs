use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use tokio::sync::{watch, Mutex};

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    peer::{PeerSession, State},
    storage_info::StorageInfo,
    store::{PieceStore, StoreStats},
    PeerId, Sha1Hash,
};

/// Information and state shared by all peer sessions of a torrent.
pub(crate) struct TorrentContext {
    /// The info hash of the torrent, derived from its metainfo. This is used to
    /// identify the torrent with other peers and trackers.
    pub info_hash: Sha1Hash,
    /// The arbitrary client id, chosen by the user of this library. This is
    /// advertised to peers and trackers.
    pub client_id: PeerId,
    /// The pieces of the torrent and their download state.
    ///
    /// All sessions go through this lock, so that picking a block, recording
    /// its arrival, and verifying a piece are each atomic with respect to
    /// other sessions.
    pub store: Mutex<PieceStore>,
    /// Set to true by the session that completes the torrent, so that the
    /// others stop waiting on their peers.
    pub completed_chan: watch::Sender<bool>,
    pub completed_port: watch::Receiver<bool>,
}

impl TorrentContext {
    pub fn new(conf: &Conf, metainfo: &Metainfo) -> Result<Self> {
        let storage = StorageInfo::new(metainfo, &conf.download_dir);
        log::debug!("Torrent storage info: {:?}", storage);
        let store = PieceStore::new(
            storage,
            metainfo.pieces.clone(),
            conf.max_pending_duration,
        )?;
        let (completed_chan, completed_port) = watch::channel(false);
        Ok(Self {
            info_hash: metainfo.info_hash,
            client_id: conf.client_id,
            store: Mutex::new(store),
            completed_chan,
            completed_port,
        })
    }
}

/// The outcome of running a torrent with a set of peers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TorrentSummary {
    /// The number of distinct peers a session was started with.
    pub session_count: usize,
    /// The number of sessions that ended with an error.
    pub failed_sessions: usize,
    /// The number of block payload bytes received from all peers.
    pub downloaded_payload: u64,
    /// Whether all pieces were downloaded and verified.
    pub is_complete: bool,
    /// The final state of the piece store.
    pub stats: StoreStats,
}

/// A torrent download from a set of peers.
pub struct Torrent {
    /// The torrent's name, used in logs.
    name: String,
    ctx: Arc<TorrentContext>,
}

impl Torrent {
    /// Sets up the torrent's piece store, with all pieces missing.
    pub fn new(conf: &Conf, metainfo: &Metainfo) -> Result<Self> {
        let ctx = TorrentContext::new(conf, metainfo)?;
        log::info!(
            "Torrent {} ({}) has {} pieces",
            metainfo.name,
            hex::encode(&metainfo.info_hash),
            metainfo.piece_count()
        );
        Ok(Self {
            name: metainfo.name.clone(),
            ctx: Arc::new(ctx),
        })
    }

    /// Returns the download counters of the torrent.
    pub async fn stats(&self) -> StoreStats {
        self.ctx.store.lock().await.stats()
    }

    /// Downloads the torrent from the given peers, with one session per
    /// distinct peer address, and returns once all sessions have ended.
    ///
    /// A failed session only removes that peer from the download. Once all
    /// sessions are done, any pieces not yet written to disk are written.
    pub async fn run(
        &self,
        peers: impl IntoIterator<Item = SocketAddr>,
    ) -> Result<TorrentSummary> {
        let mut seen = HashSet::new();
        let peers: Vec<_> =
            peers.into_iter().filter(|addr| seen.insert(*addr)).collect();
        log::info!("Torrent {} starting with {} peer(s)", self.name, peers.len());
        if peers.is_empty() {
            log::warn!("Torrent {} has no peers", self.name);
        }

        let sessions = peers.iter().map(|addr| {
            let mut session = PeerSession::outbound(Arc::clone(&self.ctx), *addr);
            tokio::spawn(async move {
                let result = session.start().await;
                debug_assert_eq!(session.state(), State::Closed);
                (result, session.stats())
            })
        });
        let outcomes = futures::future::join_all(sessions).await;

        let mut failed_sessions = 0;
        let mut downloaded_payload = 0;
        for (addr, outcome) in peers.iter().zip(outcomes) {
            match outcome {
                Ok((result, stats)) => {
                    downloaded_payload += stats.downloaded_payload;
                    if let Err(e) = result {
                        log::info!("Peer {} session failed: {}", addr, e);
                        failed_sessions += 1;
                    }
                }
                Err(e) => {
                    log::error!("Peer {} session task failed: {}", addr, e);
                    failed_sessions += 1;
                }
            }
        }

        let mut store = self.ctx.store.lock().await;
        let is_complete = store.is_complete();
        if is_complete {
            // normally done by the session that observed completion, but that
            // may have failed
            store.flush()?;
            log::info!("Torrent {} complete", self.name);
        } else {
            log::warn!(
                "Torrent {} incomplete: no peer left to download from",
                self.name
            );
        }

        Ok(TorrentSummary {
            session_count: peers.len(),
            failed_sessions,
            downloaded_payload,
            is_complete,
            stats: store.stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::{
        peer::codec::Message,
        test_utils::{make_metainfo, spawn_seed, temp_dir, Seed},
        Bitfield,
    };
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    // Tests that a torrent is downloaded from several seeds that each have
    // only some of the pieces, with duplicate and unreachable peers.
    #[tokio::test]
    async fn test_download_from_partial_seeds() {
        let dir = temp_dir("torrent-partial");
        let (metainfo, data) =
            make_metainfo("torrent-partial", &[20000, 50000], 16384);
        assert_eq!(metainfo.piece_count(), 5);
        let conf = Conf::new(&dir);
        let torrent = Torrent::new(&conf, &metainfo).unwrap();
        assert_eq!(torrent.stats().await.missing, 5);

        // each seed has a different subset of the pieces, with some overlap
        let mut first = Seed::new(metainfo.info_hash, data.clone(), 16384);
        first.pieces = Bitfield::repeat(false, 5);
        for index in 0..3 {
            first.pieces.set(index, true);
        }
        let mut second = Seed::new(metainfo.info_hash, data.clone(), 16384);
        second.pieces = Bitfield::repeat(false, 5);
        for index in 2..5 {
            second.pieces.set(index, true);
        }
        let first = spawn_seed(first).await;
        let second = spawn_seed(second).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let unreachable = listener.local_addr().unwrap();
        drop(listener);

        let summary = torrent
            .run(vec![first, second, first, unreachable])
            .await
            .unwrap();
        assert_eq!(summary.session_count, 3);
        assert_eq!(summary.failed_sessions, 1);
        assert!(summary.is_complete);
        assert_eq!(summary.downloaded_payload, 70000);
        assert_eq!(summary.stats.have, 5);
        assert_eq!(summary.stats.bytes_written, 70000);

        // multi file torrents are placed in a directory of the torrent's name
        let torrent_dir = dir.join("torrent-partial");
        let a = std::fs::read(torrent_dir.join("file0")).unwrap();
        let b = std::fs::read(torrent_dir.join("file1")).unwrap();
        assert_eq!(a, &data[..20000]);
        assert_eq!(b, &data[20000..]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    // Tests that once one peer completes the torrent, the session with a peer
    // that keeps us choked is closed too and the run returns.
    #[tokio::test]
    async fn test_complete_with_choking_peer() {
        let dir = temp_dir("torrent-choking");
        let (metainfo, data) = make_metainfo("torrent-choking", &[50000], 16384);
        let torrent = Torrent::new(&Conf::new(&dir), &metainfo).unwrap();

        let seed = spawn_seed(Seed::new(metainfo.info_hash, data.clone(), 16384))
            .await;
        // has every piece but never unchokes us
        let mut choking = Seed::new(metainfo.info_hash, data.clone(), 16384);
        choking.intro = Some(vec![
            Message::Bitfield(Bitfield::repeat(true, 4)),
            Message::KeepAlive,
        ]);
        let choking = spawn_seed(choking).await;

        let run = torrent.run(vec![seed, choking]);
        let summary = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("run did not return after completion")
            .unwrap();
        assert_eq!(summary.session_count, 2);
        assert_eq!(summary.failed_sessions, 0);
        assert!(summary.is_complete);
        assert_eq!(summary.downloaded_payload, 50000);
        assert_eq!(std::fs::read(dir.join("torrent-choking")).unwrap(), data);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    // Tests that without any peers the torrent ends incomplete.
    #[tokio::test]
    async fn test_no_peers() {
        let dir = temp_dir("torrent-nopeers");
        let (metainfo, _) = make_metainfo("torrent-nopeers", &[1000], 16384);
        let torrent = Torrent::new(&Conf::new(&dir), &metainfo).unwrap();
        let summary = torrent.run(Vec::new()).await.unwrap();
        assert_eq!(
            summary,
            TorrentSummary {
                session_count: 0,
                failed_sessions: 0,
                downloaded_payload: 0,
                is_complete: false,
                stats: StoreStats {
                    missing: 1,
                    ..Default::default()
                },
            }
        );
        assert!(!dir.exists());
    }
}
