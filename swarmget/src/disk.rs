use std::{
    fmt,
    fs::{self, File, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use nix::sys::uio::pwrite;

use crate::{
    storage_info::{FileInfo, StorageInfo},
    PieceIndex,
};

/// Error type returned on failed piece writes.
#[derive(Debug)]
pub enum WriteError {
    /// An IO error ocurred while creating or writing a file.
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A destination file of the torrent, opened for writing.
struct TorrentFile {
    info: FileInfo,
    path: PathBuf,
    handle: File,
}

impl TorrentFile {
    /// Opens the file in create and write mode at the path of combining the
    /// download directory and the path defined in the file info, creating any
    /// missing parent directories.
    fn new(download_dir: &Path, info: FileInfo) -> Result<Self, WriteError> {
        let path = download_dir.join(&info.path);
        log::trace!("Opening and creating file {:?}", path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                log::warn!("Failed to create directory {:?}", parent);
                WriteError::Io(e)
            })?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                WriteError::Io(e)
            })?;
        Ok(Self { info, path, handle })
    }

    /// Writes the buffer at the offset in file, calling pwrite repeatedly
    /// until the whole buffer is written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), WriteError> {
        debug_assert!(offset + buf.len() as u64 <= self.info.len);

        // a single pwrite may transfer fewer bytes than asked for
        let mut written = 0;
        while written < buf.len() {
            let count = pwrite(
                self.handle.as_raw_fd(),
                &buf[written..],
                (offset + written as u64) as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.path, e);
                WriteError::Io(std::io::Error::last_os_error())
            })?;
            written += count;
        }

        Ok(())
    }
}

/// Writes complete pieces into the torrent's destination files, at the
/// pieces' offsets in the logical concatenation of all files.
pub(crate) struct Writer {
    files: Vec<TorrentFile>,
}

impl Writer {
    /// Creates (or opens, if they exist) all files of the torrent in its
    /// download directory.
    pub fn new(info: &StorageInfo) -> Result<Self, WriteError> {
        log::info!("Opening files in {:?}", info.download_dir);
        let files = info
            .structure
            .files()
            .iter()
            .map(|file| TorrentFile::new(&info.download_dir, file.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { files })
    }

    /// Writes the piece's data to every file its byte range intersects and
    /// returns the number of bytes written.
    pub fn write_piece(
        &self,
        info: &StorageInfo,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<u64, WriteError> {
        let piece_range = info.piece_range(index);
        debug_assert_eq!(piece_range.end - piece_range.start, data.len() as u64);
        let files = info.files_intersecting_piece(index);
        log::debug!(
            "Writing piece {} ({} bytes) to files {:?}",
            index,
            data.len(),
            files
        );

        let mut written = 0;
        // zero length files have no slice and are skipped
        for file in &self.files[files] {
            if let Some(slice) = file.info.slice_of(&piece_range) {
                let start = slice.range_offset as usize;
                let buf = &data[start..start + slice.len as usize];
                log::trace!(
                    "Writing {} bytes of piece {} to {:?} at offset {}",
                    buf.len(),
                    index,
                    file.path,
                    slice.file_offset
                );
                file.write_at(slice.file_offset, buf)?;
                written += buf.len() as u64;
            }
        }

        debug_assert_eq!(written, data.len() as u64);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FsStructure;
    use pretty_assertions::assert_eq;

    fn make_storage_info(dir: &Path, structure: FsStructure, piece_len: u32) -> StorageInfo {
        let download_len = structure.download_len();
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len =
            (download_len - (piece_count as u64 - 1) * piece_len as u64) as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: dir.to_path_buf(),
            structure,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("swarmget-disk-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    // Tests that a piece spanning the boundary of two files is split between
    // them, at the right offsets.
    #[test]
    fn test_write_piece_across_files() {
        let dir = temp_dir("across");
        let structure = FsStructure::Archive {
            files: vec![
                FileInfo {
                    path: "a".into(),
                    len: 20000,
                    torrent_offset: 0,
                },
                FileInfo {
                    path: PathBuf::from("sub").join("b"),
                    len: 50000,
                    torrent_offset: 20000,
                },
            ],
        };
        let info = make_storage_info(&dir, structure, 32768);
        let writer = Writer::new(&info).unwrap();

        let piece: Vec<u8> = (0..32768u32).map(|i| (i % 256) as u8).collect();
        let written = writer.write_piece(&info, 0, &piece).unwrap();
        assert_eq!(written, 32768);

        let a = fs::read(dir.join("a")).unwrap();
        let b = fs::read(dir.join("sub").join("b")).unwrap();
        assert_eq!(a, &piece[..20000]);
        assert_eq!(b, &piece[20000..]);

        // the second piece starts in the middle of the second file
        let piece = vec![0xab; 32768];
        writer.write_piece(&info, 1, &piece).unwrap();
        let b = fs::read(dir.join("sub").join("b")).unwrap();
        assert_eq!(b.len(), 32768 - 20000 + 32768);
        assert!(b[32768 - 20000..].iter().all(|byte| *byte == 0xab));

        fs::remove_dir_all(&dir).unwrap();
    }

    // Tests that zero length files are created but never written to.
    #[test]
    fn test_zero_len_file() {
        let dir = temp_dir("empty");
        let structure = FsStructure::Archive {
            files: vec![
                FileInfo {
                    path: "a".into(),
                    len: 100,
                    torrent_offset: 0,
                },
                FileInfo {
                    path: "empty".into(),
                    len: 0,
                    torrent_offset: 100,
                },
                FileInfo {
                    path: "c".into(),
                    len: 100,
                    torrent_offset: 100,
                },
            ],
        };
        let info = make_storage_info(&dir, structure, 200);
        let writer = Writer::new(&info).unwrap();
        let piece = vec![7; 200];
        assert_eq!(writer.write_piece(&info, 0, &piece).unwrap(), 200);

        assert_eq!(fs::read(dir.join("a")).unwrap(), vec![7; 100]);
        assert!(fs::read(dir.join("empty")).unwrap().is_empty());
        assert_eq!(fs::read(dir.join("c")).unwrap(), vec![7; 100]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
