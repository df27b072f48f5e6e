//! The entry point of the library: gathers peers and runs a torrent download
//! to completion.

use std::net::SocketAddr;

use tokio::runtime::Runtime;

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    torrent::{Torrent, TorrentSummary},
    tracker::{Announce, Event, Tracker},
};

/// The port reported to trackers. We don't accept incoming connections, but
/// the announce requires one.
const ANNOUNCE_PORT: u16 = 6881;

/// Downloads the torrent on a new tokio runtime, blocking until the download
/// finishes.
///
/// See [`download`].
pub fn run_torrent(
    conf: Conf,
    metainfo: Metainfo,
    peers: Vec<SocketAddr>,
) -> Result<TorrentSummary> {
    let rt = Runtime::new()?;
    rt.block_on(download(conf, metainfo, peers))
}

/// Downloads the torrent from the given peers and, if the torrent has an HTTP
/// tracker and the configuration asks for it, the peers returned by the
/// tracker.
///
/// A failed announce is only an error if it leaves us without any peers.
pub async fn download(
    conf: Conf,
    metainfo: Metainfo,
    mut peers: Vec<SocketAddr>,
) -> Result<TorrentSummary> {
    let tracker = match (&metainfo.announce, conf.tracker_peer_count) {
        (Some(url), Some(_)) => Some(Tracker::new(url.clone())),
        _ => None,
    };

    if let Some(tracker) = &tracker {
        let announce = Announce {
            info_hash: metainfo.info_hash,
            peer_id: conf.client_id,
            port: ANNOUNCE_PORT,
            downloaded: 0,
            uploaded: 0,
            left: metainfo.structure.download_len(),
            peer_count: conf.tracker_peer_count,
            event: Some(Event::Started),
        };
        match tracker.announce(announce).await {
            Ok(resp) => peers.extend(resp.peers),
            Err(e) if peers.is_empty() => {
                log::error!("Tracker {} announce failed: {}", tracker, e);
                return Err(e.into());
            }
            Err(e) => {
                log::warn!("Tracker {} announce failed: {}", tracker, e);
            }
        }
    }

    let torrent = Torrent::new(&conf, &metainfo)?;
    let summary = torrent.run(peers).await?;
    log::info!("Torrent {} summary: {:?}", metainfo.name, summary);

    if let (Some(tracker), true) = (&tracker, summary.is_complete) {
        let announce = Announce {
            info_hash: metainfo.info_hash,
            peer_id: conf.client_id,
            port: ANNOUNCE_PORT,
            downloaded: summary.downloaded_payload,
            uploaded: 0,
            left: 0,
            peer_count: None,
            event: Some(Event::Completed),
        };
        // the download is done regardless of whether the tracker hears of it
        if let Err(e) = tracker.announce(announce).await {
            log::warn!("Tracker {} completion announce failed: {}", tracker, e);
        }
    }

    Ok(summary)
}
