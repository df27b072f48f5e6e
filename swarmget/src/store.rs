//! The piece store: which pieces we have, which ones are being downloaded and
//! which blocks are requested from peers.
//!
//! Each piece is in exactly one of three states at any time:
//! - missing: not yet picked for any peer,
//! - ongoing: picked, with some of its blocks requested or retrieved,
//! - have: all blocks retrieved and the piece's hash verified.
//!
//! Pieces only move forward through these states: a piece whose hash doesn't
//! match stays ongoing with all its blocks missing again.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{
    disk::{WriteError, Writer},
    download::PieceDownload,
    error::*,
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex, Sha1Hash,
};

/// A block request that has been sent to a peer and is awaiting its data.
#[derive(Clone, Copy, Debug)]
struct PendingRequest {
    block: BlockInfo,
    requested_at: Instant,
}

/// Counters describing the state of the download.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StoreStats {
    /// The number of pieces not yet picked.
    pub missing: usize,
    /// The number of pieces being downloaded.
    pub ongoing: usize,
    /// The number of downloaded and verified pieces.
    pub have: usize,
    /// The number of block requests awaiting data.
    pub pending: usize,
    /// The number of pieces whose data didn't match their hash.
    pub hash_failures: usize,
    /// The number of timed out block requests that were issued again.
    pub reissued: usize,
    /// The number of bytes written to the destination files.
    pub bytes_written: u64,
}

/// Owns the piece and block state of a torrent download and decides which
/// block to request from which peer.
///
/// It's shared by all peer sessions of a torrent, which must serialize their
/// access to it (see [`crate::torrent::Torrent`]).
pub struct PieceStore {
    /// The torrent's piece and file geometry.
    info: StorageInfo,
    /// The concatenation of the expected SHA-1 hash of each piece.
    piece_hashes: Vec<u8>,
    /// Peer piece availability and piece frequencies.
    picker: PiecePicker,
    /// The pieces not yet picked, in index order.
    missing: BTreeSet<PieceIndex>,
    /// The pieces being downloaded.
    ongoing: BTreeMap<PieceIndex, PieceDownload>,
    /// The pieces we have. The bitfield is pre-allocated to the number of
    /// pieces in the torrent and each piece that we have is set to true.
    have: Bitfield,
    /// The data of verified pieces not yet written to disk.
    unflushed: BTreeMap<PieceIndex, Vec<u8>>,
    /// The requested blocks awaiting data, keyed by their piece index and
    /// offset, so that there is at most one request per block.
    pending: BTreeMap<(PieceIndex, u32), PendingRequest>,
    /// A pending request older than this is issued again.
    max_pending_duration: Duration,
    /// Created on the first flush.
    writer: Option<Writer>,
    hash_failures: usize,
    reissued: usize,
    bytes_written: u64,
}

impl PieceStore {
    /// Creates a new store for the torrent with all pieces missing.
    ///
    /// `piece_hashes` is the concatenation of the 20 byte hash of each piece,
    /// so it must have exactly 20 bytes per piece.
    pub fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        max_pending_duration: Duration,
    ) -> Result<Self> {
        if info.piece_count == 0 || piece_hashes.len() != info.piece_count * 20
        {
            return Err(Error::InvalidPieces);
        }

        let piece_count = info.piece_count;
        Ok(Self {
            info,
            piece_hashes,
            picker: PiecePicker::new(piece_count),
            missing: (0..piece_count).collect(),
            ongoing: BTreeMap::new(),
            have: Bitfield::repeat(false, piece_count),
            unflushed: BTreeMap::new(),
            pending: BTreeMap::new(),
            max_pending_duration,
            writer: None,
            hash_failures: 0,
            reissued: 0,
            bytes_written: 0,
        })
    }

    /// Records the peer's initial piece availability.
    pub fn register_peer(&mut self, addr: SocketAddr, pieces: &Bitfield) {
        self.picker.register_peer(addr, pieces);
    }

    /// Makes the peer known with no pieces, so that the pieces it announces
    /// one by one are recorded even if it never sends a bitfield.
    pub fn add_peer(&mut self, addr: SocketAddr) {
        let pieces = Bitfield::repeat(false, self.info.piece_count);
        self.picker.register_peer(addr, &pieces);
    }

    /// Records that the peer has a piece. It's a no-op if the peer is not
    /// registered or if it was already known to have the piece.
    pub fn update_peer(&mut self, addr: &SocketAddr, index: PieceIndex) {
        self.picker.update_peer(addr, index);
    }

    /// Returns whether the peer has any piece that we don't.
    pub fn is_interesting(&self, addr: &SocketAddr) -> bool {
        (0..self.info.piece_count)
            .any(|index| !self.have[index] && self.picker.has_piece(addr, index))
    }

    /// Returns the next block to request from the peer, or `None` if the peer
    /// has nothing we can request at this time.
    ///
    /// In order of priority, this is:
    /// 1. a block whose request timed out, in a piece the peer has,
    /// 2. the first missing block of an ongoing piece the peer has,
    /// 3. the first block of the rarest missing piece the peer has.
    pub fn next_request(&mut self, addr: &SocketAddr) -> Option<BlockInfo> {
        let now = Instant::now();

        // re-issue a timed out request, without creating a new entry for it
        let picker = &self.picker;
        let max_pending_duration = self.max_pending_duration;
        if let Some(request) = self.pending.values_mut().find(|request| {
            now.saturating_duration_since(request.requested_at)
                > max_pending_duration
                && picker.has_piece(addr, request.block.piece_index)
        }) {
            log::info!(
                "Re-requesting timed out block {} from peer {}",
                request.block,
                addr
            );
            request.requested_at = now;
            self.reissued += 1;
            return Some(request.block);
        }

        // finish ongoing pieces before starting new ones
        for (index, download) in self.ongoing.iter_mut() {
            if !picker.has_piece(addr, *index) {
                continue;
            }
            if let Some(block) = download.pick_missing() {
                Self::add_pending(&mut self.pending, block, now);
                return Some(block);
            }
        }

        let index = picker.pick_rarest(addr, self.missing.iter().copied())?;
        self.missing.remove(&index);
        let piece_len = self.info.piece_len(index);
        let mut download =
            PieceDownload::new(index, piece_len, self.piece_hash(index));
        let block = download.pick_missing();
        log::debug!(
            "Starting piece {} ({} blocks, {} peer(s) have it) for peer {}",
            index,
            download.block_count(),
            picker.frequency(index),
            addr
        );
        self.ongoing.insert(index, download);
        let block = block?;
        Self::add_pending(&mut self.pending, block, now);
        Some(block)
    }

    fn add_pending(
        pending: &mut BTreeMap<(PieceIndex, u32), PendingRequest>,
        block: BlockInfo,
        requested_at: Instant,
    ) {
        let prev = pending.insert(
            (block.piece_index, block.offset),
            PendingRequest {
                block,
                requested_at,
            },
        );
        debug_assert!(prev.is_none());
    }

    /// Records the arrival of a block from the peer.
    ///
    /// If this completes the block's piece, the piece's hash is verified: if
    /// it matches, the piece becomes one we have, otherwise all its blocks are
    /// reset to missing so that they are requested again.
    ///
    /// Blocks of pieces that are not being downloaded or that don't match
    /// a block of their piece are ignored. If the block was requested but its
    /// data is unusable, the request is dropped and the block is missing
    /// again, so that it's requested anew.
    pub fn block_received(
        &mut self,
        addr: &SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) {
        let download = match self.ongoing.get_mut(&piece_index) {
            Some(download) => download,
            None => {
                if self.have.get(piece_index).map(|b| *b).unwrap_or(false) {
                    log::debug!(
                        "Peer {} sent block of piece {} we already have",
                        addr,
                        piece_index
                    );
                } else {
                    log::warn!(
                        "Peer {} sent block of piece {} not being downloaded",
                        addr,
                        piece_index
                    );
                }
                return;
            }
        };

        // a request exists for each pending block of an ongoing piece, and
        // only for those
        let key = (piece_index, offset);
        if !download.received(offset, data) {
            if self.pending.remove(&key).is_some() {
                download.free_block(offset);
            }
            return;
        }
        self.pending.remove(&key);

        if !download.is_complete() {
            log::trace!(
                "Piece {} has {}/{} blocks",
                piece_index,
                download.count_retrieved(),
                download.block_count()
            );
            return;
        }

        if download.hash_matches() {
            let data = download.assembled_data();
            self.ongoing.remove(&piece_index);
            self.have.set(piece_index, true);
            if let Some(data) = data {
                self.unflushed.insert(piece_index, data);
            }
            log::info!(
                "Downloaded piece {} ({}/{})",
                piece_index,
                self.have.count_ones(),
                self.info.piece_count
            );
        } else {
            log::warn!(
                "Piece {} from peer {} failed hash check, re-downloading",
                piece_index,
                addr
            );
            download.reset();
            self.hash_failures += 1;
        }
    }

    /// Returns true if we have all pieces of the torrent.
    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    /// Returns whether we have the piece.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.have.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Writes all verified pieces not yet written to the destination files, at
    /// their offsets in the torrent, and returns the total number of bytes
    /// written so far.
    ///
    /// Each piece is written only once and its data is released afterwards,
    /// so calling this again without new pieces is a no-op.
    pub fn flush(&mut self) -> Result<u64, WriteError> {
        if self.unflushed.is_empty() {
            return Ok(self.bytes_written);
        }

        if self.writer.is_none() {
            self.writer = Some(Writer::new(&self.info)?);
        }
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(self.bytes_written),
        };

        log::info!("Writing {} piece(s) to disk", self.unflushed.len());
        let indices: Vec<_> = self.unflushed.keys().copied().collect();
        for index in indices {
            if let Some(data) = self.unflushed.get(&index) {
                self.bytes_written +=
                    writer.write_piece(&self.info, index, data)?;
            }
            // the piece is released only once it's on disk
            self.unflushed.remove(&index);
        }

        log::info!("Wrote {} bytes to disk", self.bytes_written);
        Ok(self.bytes_written)
    }

    /// Returns the current download counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            missing: self.missing.len(),
            ongoing: self.ongoing.len(),
            have: self.have.count_ones(),
            pending: self.pending.len(),
            hash_failures: self.hash_failures,
            reissued: self.reissued,
            bytes_written: self.bytes_written,
        }
    }

    fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[index * 20..index * 20 + 20]);
        hash
    }
}
