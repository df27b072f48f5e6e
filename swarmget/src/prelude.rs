//! This module exports types commonly used by applications as a convenience.

pub use crate::{
    conf::Conf,
    engine,
    error::{Error, Result},
    metainfo::Metainfo,
    store::StoreStats,
    torrent::{Torrent, TorrentSummary},
};
