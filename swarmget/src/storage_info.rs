//! How a torrent's pieces map onto its files.
//!
//! The files of a torrent are laid out end to end as one contiguous byte
//! stream, and piece `i` covers bytes `[i * piece_len, i * piece_len + len)` of
//! that stream. Everything here works in those absolute torrent offsets.

use std::{
    ops::Range,
    path::{Path, PathBuf},
};

use crate::{metainfo::Metainfo, FileIndex, PieceIndex};

/// A destination file of the torrent.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's path, relative to the torrent's download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The absolute offset of the file's first byte in the torrent. Always 0
    /// for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns the offset one past the file's last byte in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns where the part of the torrent byte range that falls into this
    /// file is, or `None` if the range and the file don't overlap.
    pub(crate) fn slice_of(&self, bytes: &Range<u64>) -> Option<FileSlice> {
        let start = bytes.start.max(self.torrent_offset);
        let end = bytes.end.min(self.torrent_end_offset());
        if start >= end {
            return None;
        }
        Some(FileSlice {
            file_offset: start - self.torrent_offset,
            range_offset: start - bytes.start,
            len: end - start,
        })
    }
}

/// The overlap of a torrent byte range with one file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// Where the overlap starts in the file.
    pub file_offset: u64,
    /// Where the overlap starts in the byte range.
    pub range_offset: u64,
    pub len: u64,
}

/// The piece and file geometry of a torrent, along with where its files are
/// placed.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    pub piece_count: usize,
    /// The length of every piece but the last.
    pub piece_len: u32,
    /// The length of the last piece, which is shorter than the others if the
    /// download length is not a multiple of the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files.
    pub download_len: u64,
    /// The directory the file paths are relative to: the download directory
    /// for a single file torrent, and the download directory joined with the
    /// torrent's name for a multi file torrent.
    pub download_dir: PathBuf,
    pub structure: FsStructure,
}

impl StorageInfo {
    pub fn new(metainfo: &Metainfo, download_dir: &Path) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.structure.download_len();
        let piece_len = metainfo.piece_len;
        let last_piece_len = (download_len
            - piece_len as u64 * (piece_count as u64 - 1))
            as u32;

        let download_dir = match &metainfo.structure {
            FsStructure::File(_) => download_dir.to_path_buf(),
            FsStructure::Archive { .. } => download_dir.join(&metainfo.name),
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure: metainfo.structure.clone(),
        }
    }

    /// Returns the length of the piece, which must be in the torrent.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        debug_assert!(index < self.piece_count);
        if index + 1 == self.piece_count {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Returns the absolute byte range the piece covers in the torrent.
    pub fn piece_range(&self, index: PieceIndex) -> Range<u64> {
        let start = index as u64 * self.piece_len as u64;
        start..start + self.piece_len(index) as u64
    }

    /// Returns the indices of the files the piece has bytes in.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Range<FileIndex> {
        self.structure.files_intersecting_bytes(self.piece_range(index))
    }
}

/// The files of the download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    File(FileInfo),
    /// Multiple files, in the order they are declared in the metainfo, which
    /// is also the order in which they are laid out in the torrent.
    Archive { files: Vec<FileInfo> },
}

impl FsStructure {
    /// Returns the total download size in bytes.
    pub fn download_len(&self) -> u64 {
        self.files().iter().map(|f| f.len).sum()
    }

    /// Returns the files of the torrent in order.
    pub fn files(&self) -> &[FileInfo] {
        match self {
            Self::File(file) => std::slice::from_ref(file),
            Self::Archive { files } => files,
        }
    }

    /// Returns the indices of the files that hold bytes of the absolute range.
    ///
    /// Zero length files inside the range are included, and the result is
    /// empty if no file overlaps the range.
    pub fn files_intersecting_bytes(
        &self,
        bytes: Range<u64>,
    ) -> Range<FileIndex> {
        let files = self.files();
        // files are sorted by offset, and so by end offset too
        let first =
            files.partition_point(|f| f.torrent_end_offset() <= bytes.start);
        let end = files.partition_point(|f| f.torrent_offset < bytes.end);
        first..end.max(first)
    }
}
