#[macro_use]
extern crate serde_derive;

mod disk;
mod download;
pub mod conf;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_picker;
pub mod prelude;
pub mod storage_info;
pub mod store;
#[cfg(test)]
mod test_utils;
pub mod torrent;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use peer::{HandshakeError, PeerError};

/// The 20 byte arbitrary id a client announces to peers and trackers.
pub type PeerId = [u8; 20];
pub type Sha1Hash = [u8; 20];

/// The index of a piece within the torrent.
pub type PieceIndex = usize;
/// The index of a file within the torrent's file list.
pub type FileIndex = usize;

/// The bitfield represents the piece availability of a peer. It is a compact
/// bool vector of most significant bits to least significants bits, that is,
/// where the first highest bit represents the first piece, the second highest
/// element the second piece, and so on (e.g. `0b1100_0001` would mean that we
/// have pieces 0, 1, and 7). A truthy boolean value of a piece's position in
/// this vector means that the peer has the piece, while a falsy value means it
/// doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// The length of a block request. All blocks are of this length except
/// possibly the last block of the last piece, which may be shorter.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(piece: {} offset: {} len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Returns the length of the block at the index in piece.
///
/// Only the last block of a piece may be shorter than `BLOCK_LEN`.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_offset = block_index as u32 * BLOCK_LEN;
    debug_assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}
