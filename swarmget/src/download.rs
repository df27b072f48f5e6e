use sha1::{Digest, Sha1};

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN};

/// The state of a single block in a piece.
#[derive(Clone, Debug, PartialEq)]
enum Block {
    /// Not yet requested from any peer.
    Missing,
    /// Requested from a peer, awaiting the data.
    Pending,
    /// The block's data has arrived.
    Retrieved(Vec<u8>),
}

/// Tracks the completion of a piece download: which of its blocks are still
/// missing, which are requested and the data of those that have arrived.
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The expected SHA-1 hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The blocks in this piece, ordered by their offset. The vec is
    /// preallocated to the number of blocks in piece.
    blocks: Vec<Block>,
}

impl PieceDownload {
    /// Creates a new piece download instance for the given piece, with all its
    /// blocks missing.
    pub fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        Self {
            index,
            len,
            expected_hash,
            blocks: vec![Block::Missing; block_count(len)],
        }
    }

    /// Returns the number of blocks in this piece.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the block info of the block at the given index in piece.
    fn block_info(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(self.len, block_index),
        }
    }

    /// Picks the first missing block in piece and marks it as pending, or
    /// returns `None` if no block is missing.
    pub fn pick_missing(&mut self) -> Option<BlockInfo> {
        let block_index =
            self.blocks.iter().position(|b| *b == Block::Missing)?;
        self.blocks[block_index] = Block::Pending;
        let block = self.block_info(block_index);
        log::trace!("Picked block {} in piece {}", block, self.index);
        Some(block)
    }

    /// Stores the data of the block at the given offset and returns whether
    /// it was accepted.
    ///
    /// The block is rejected if the offset is not that of a block in this
    /// piece, if the data length isn't the block's length, or if the block was
    /// already retrieved.
    pub fn received(&mut self, offset: u32, data: Vec<u8>) -> bool {
        if offset % BLOCK_LEN != 0 || offset >= self.len {
            log::warn!(
                "Piece {} has no block at offset {}",
                self.index,
                offset
            );
            return false;
        }

        let block_index = (offset / BLOCK_LEN) as usize;
        let expected_len = block_len(self.len, block_index);
        if data.len() != expected_len as usize {
            log::warn!(
                "Piece {} block at offset {} has length {}, expected {}",
                self.index,
                offset,
                data.len(),
                expected_len
            );
            return false;
        }

        let block = &mut self.blocks[block_index];
        if let Block::Retrieved(_) = block {
            log::debug!(
                "Duplicate piece {} block at offset {}",
                self.index,
                offset
            );
            return false;
        }

        log::trace!("Received piece {} block at offset {}", self.index, offset);
        *block = Block::Retrieved(data);
        true
    }

    /// Marks the requested block at the offset as missing again, so that it's
    /// picked anew. Returns whether there was such a block.
    pub fn free_block(&mut self, offset: u32) -> bool {
        if offset % BLOCK_LEN != 0 {
            return false;
        }
        match self.blocks.get_mut((offset / BLOCK_LEN) as usize) {
            Some(block) if *block == Block::Pending => {
                *block = Block::Missing;
                true
            }
            _ => false,
        }
    }

    /// Returns true if all blocks in piece have been retrieved.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| matches!(b, Block::Retrieved(_)))
    }

    /// Returns the number of blocks that have been retrieved.
    pub fn count_retrieved(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, Block::Retrieved(_)))
            .count()
    }

    /// Calculates the piece's hash using all its retrieved blocks and returns
    /// if it matches the expected hash.
    pub fn hash_matches(&self) -> bool {
        debug_assert!(self.is_complete());
        let mut hasher = Sha1::new();
        for block in self.blocks.iter() {
            if let Block::Retrieved(data) = block {
                hasher.update(data);
            }
        }
        let hash = hasher.finalize();
        log::debug!("Piece {} hash: {}", self.index, hex::encode(&hash));
        hash.as_slice() == self.expected_hash
    }

    /// Concatenates the retrieved blocks into the piece's data, or returns
    /// `None` if the piece is not complete.
    pub fn assembled_data(&self) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(self.len as usize);
        for block in self.blocks.iter() {
            match block {
                Block::Retrieved(block) => data.extend_from_slice(block),
                _ => return None,
            }
        }
        debug_assert_eq!(data.len(), self.len as usize);
        Some(data)
    }

    /// Resets all blocks to missing, dropping any retrieved data.
    pub fn reset(&mut self) {
        log::trace!("Resetting all blocks in piece {}", self.index);
        for block in self.blocks.iter_mut() {
            *block = Block::Missing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hash(data: &[u8]) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        hash
    }

    // Tests that all blocks of a piece are picked in order, with the last one
    // being shorter, and that a fully picked piece has nothing more to pick.
    #[test]
    fn test_pick_all_blocks() {
        let piece_len = 2 * BLOCK_LEN + 1000;
        let mut download = PieceDownload::new(3, piece_len, [0; 20]);
        assert_eq!(download.block_count(), 3);

        for i in 0..2 {
            assert_eq!(
                download.pick_missing(),
                Some(BlockInfo {
                    piece_index: 3,
                    offset: i * BLOCK_LEN,
                    len: BLOCK_LEN,
                })
            );
        }
        assert_eq!(
            download.pick_missing(),
            Some(BlockInfo {
                piece_index: 3,
                offset: 2 * BLOCK_LEN,
                len: 1000,
            })
        );
        assert_eq!(download.pick_missing(), None);
    }

    // Tests that a piece of length 32 KiB is split into two 16 KiB blocks and
    // its assembled data hashes to the piece hash.
    #[test]
    fn test_two_block_piece() {
        let data: Vec<u8> = (0..2 * BLOCK_LEN).map(|i| i as u8).collect();
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN, hash(&data));
        assert_eq!(download.block_count(), 2);

        let first = download.pick_missing().unwrap();
        let second = download.pick_missing().unwrap();
        assert_eq!(first.len, BLOCK_LEN);
        assert_eq!(second.len, BLOCK_LEN);

        // blocks may arrive out of order
        assert!(download
            .received(second.offset, data[BLOCK_LEN as usize..].to_vec()));
        assert!(!download.is_complete());
        assert!(download
            .received(first.offset, data[..BLOCK_LEN as usize].to_vec()));
        assert!(download.is_complete());
        assert!(download.hash_matches());
        assert_eq!(download.assembled_data(), Some(data));
    }

    // Tests that the single block of a short last piece has the piece's
    // length.
    #[test]
    fn test_short_last_piece() {
        let mut download = PieceDownload::new(1, 7232, [0; 20]);
        assert_eq!(download.block_count(), 1);
        let block = download.pick_missing().unwrap();
        assert_eq!(block.len, 7232);
        // a full length block is rejected
        assert!(!download.received(0, vec![0; BLOCK_LEN as usize]));
        assert!(download.received(0, vec![0; 7232]));
        assert!(download.is_complete());
    }

    #[test]
    fn test_invalid_blocks_rejected() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN, [0; 20]);
        // not at a block boundary
        assert!(!download.received(100, vec![0; BLOCK_LEN as usize]));
        // past the end of the piece
        assert!(!download.received(2 * BLOCK_LEN, vec![0; BLOCK_LEN as usize]));
        // duplicate
        assert!(download.received(0, vec![0; BLOCK_LEN as usize]));
        assert!(!download.received(0, vec![1; BLOCK_LEN as usize]));
        assert_eq!(download.count_retrieved(), 1);
    }

    // Tests that only a requested block can be freed, and that a freed block
    // is picked again.
    #[test]
    fn test_free_block() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN, [0; 20]);
        // nothing requested yet
        assert!(!download.free_block(0));

        let first = download.pick_missing().unwrap();
        let second = download.pick_missing().unwrap();
        assert!(!download.free_block(100));
        assert!(download.free_block(second.offset));
        assert!(!download.free_block(second.offset));
        assert_eq!(download.pick_missing(), Some(second));

        assert!(download.received(first.offset, vec![0; BLOCK_LEN as usize]));
        // a retrieved block stays retrieved
        assert!(!download.free_block(first.offset));
        assert_eq!(download.count_retrieved(), 1);
    }

    // Tests that a piece whose data doesn't match the expected hash is
    // detected and can be reset so that all its blocks are picked again.
    #[test]
    fn test_hash_mismatch_and_reset() {
        let mut download = PieceDownload::new(0, BLOCK_LEN, hash(b"expected"));
        let block = download.pick_missing().unwrap();
        assert!(download.received(block.offset, vec![0; BLOCK_LEN as usize]));
        assert!(download.is_complete());
        assert!(!download.hash_matches());

        download.reset();
        assert!(!download.is_complete());
        assert_eq!(download.count_retrieved(), 0);
        assert_eq!(download.assembled_data(), None);
        assert_eq!(download.pick_missing(), Some(block));
    }
}
