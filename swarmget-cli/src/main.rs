use std::{net::SocketAddr, path::PathBuf, time::Duration};

use flexi_logger::{Duplicate, FileSpec, Logger};
use structopt::StructOpt;
use swarmget::prelude::*;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(StructOpt, Debug)]
#[structopt(about = "Downloads a torrent from its peers")]
pub struct Args {
    /// The path of the folder where to download the torrent.
    #[structopt(short, long)]
    download_dir: PathBuf,

    /// The path to the torrent metainfo file.
    #[structopt(short, long)]
    metainfo: PathBuf,

    /// A comma separated list of <ip>:<port> pairs of peers to download from,
    /// in addition to those returned by the tracker.
    #[structopt(short, long, use_delimiter = true)]
    peers: Vec<SocketAddr>,

    /// Don't ask the torrent's tracker for peers.
    #[structopt(long)]
    no_tracker: bool,

    /// The number of seconds after which an unanswered block request is sent
    /// again.
    #[structopt(long)]
    max_pending_secs: Option<u64>,

    /// If set, the log is also written to a file in this folder.
    #[structopt(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_args();

    // the log level is taken from RUST_LOG, defaulting to info
    let logger = Logger::try_with_env_or_str("info")?;
    let _logger = match &args.log_dir {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir))
            .duplicate_to_stderr(Duplicate::Info)
            .start()?,
        None => logger.start()?,
    };

    let buf = tokio::fs::read(&args.metainfo).await?;
    let metainfo = Metainfo::from_bytes(&buf)?;
    log::info!(
        "Read torrent {} ({}): {} bytes in {} pieces",
        metainfo.name,
        hex::encode(&metainfo.info_hash),
        metainfo.structure.download_len(),
        metainfo.piece_count()
    );

    let mut conf = Conf::new(args.download_dir);
    if args.no_tracker {
        conf.tracker_peer_count = None;
    }
    if let Some(secs) = args.max_pending_secs {
        conf.max_pending_duration = Duration::from_secs(secs);
    }
    log::info!("Client id: {}", String::from_utf8_lossy(&conf.client_id));

    let summary = engine::download(conf, metainfo, args.peers).await?;
    println!(
        "Downloaded {} of {} pieces from {} peer(s) ({} failed), wrote {} bytes",
        summary.stats.have,
        summary.stats.have + summary.stats.ongoing + summary.stats.missing,
        summary.session_count,
        summary.failed_sessions,
        summary.stats.bytes_written
    );

    if summary.is_complete {
        Ok(())
    } else {
        Err("download incomplete: no peer left to download from".into())
    }
}
