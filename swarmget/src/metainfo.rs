use url::Url;

use crate::{
    error::*,
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// The parsed and validated torrent metainfo file, containing necessary
/// arguments for starting a torrent.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent, which is usually used to form the download
    /// path.
    pub name: String,
    /// This hash is used to identify a torrent with trackers and peers.
    pub info_hash: Sha1Hash,
    /// The concatenation of the 20 byte SHA-1 hash of each piece in torrent.
    /// This is used to verify the data sent to us by peers.
    pub pieces: Vec<u8>,
    /// The nominal lenght of a piece, that is, the length of all but
    /// potentially the last piece, which may be smaller.
    pub piece_len: u32,
    /// The paths and lenths of the downloaded files.
    pub structure: FsStructure,
    /// The HTTP tracker of the torrent, if the metainfo had a valid one.
    pub announce: Option<Url>,
}

impl Metainfo {
    /// Parses from a byte buffer a new [`Metainfo`] instance, or aborts with an
    /// error.
    ///
    /// If the encoding itself is correct, the constructor may still fail if the
    /// metadata is not semantically correct (e.g. if the length of the `pieces`
    /// field is not a multiple of 20, or no valid files are encoded, etc).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        // parse metainfo, but correctly parsing is not enough, we need to
        // verify it afterwards
        let metainfo: raw::Metainfo = serde_bencode::from_bytes(buf)?;

        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
        // must be a multiple of 20
        if metainfo.info.pieces.is_empty()
            || metainfo.info.pieces.len() % 20 != 0
        {
            return Err(Error::InvalidPieces);
        }

        // the name is the single file's path or the files' directory, so it
        // must be a single component that stays in the download directory
        if !is_valid_path_component(&metainfo.info.name) {
            log::warn!("Metainfo name {:?} invalid", metainfo.info.name);
            return Err(Error::InvalidMetainfo);
        }

        if metainfo.info.piece_len == 0 {
            log::warn!("Metainfo piece length must not be zero");
            return Err(Error::InvalidMetainfo);
        }

        // verify download structure
        let structure = if let Some(len) = metainfo.info.len {
            if metainfo.info.files.is_some() {
                log::warn!("Metainfo cannot contain both `length` and `files`");
                return Err(Error::InvalidMetainfo);
            }
            FsStructure::File(FileInfo {
                path: metainfo.info.name.clone().into(),
                len,
                torrent_offset: 0,
            })
        } else if let Some(files) = &metainfo.info.files {
            if files.is_empty() {
                log::warn!("Metainfo files must not be empty");
                return Err(Error::InvalidMetainfo);
            }

            let mut torrent_offset = 0;
            let mut file_infos = Vec::with_capacity(files.len());
            for file in files.iter() {
                // a path must have at least one component and none of them
                // may escape the download directory
                if file.path.is_empty()
                    || !file.path.iter().all(|p| is_valid_path_component(p))
                {
                    log::warn!("Metainfo file path {:?} invalid", file.path);
                    return Err(Error::InvalidMetainfo);
                }
                file_infos.push(FileInfo {
                    path: file.path.iter().collect(),
                    len: file.len,
                    torrent_offset,
                });
                torrent_offset += file.len;
            }

            FsStructure::Archive { files: file_infos }
        } else {
            log::warn!("No `length` or `files` key present in metainfo");
            return Err(Error::InvalidMetainfo);
        };

        // the number of hashes must cover the whole download and no more
        let download_len = structure.download_len();
        let piece_len = metainfo.info.piece_len as u64;
        let expected_piece_count = (download_len + piece_len - 1) / piece_len;
        if download_len == 0
            || expected_piece_count != (metainfo.info.pieces.len() / 20) as u64
        {
            log::warn!(
                "Metainfo has {} piece hashes for {} bytes",
                metainfo.info.pieces.len() / 20,
                download_len
            );
            return Err(Error::InvalidPieces);
        }

        let announce = match &metainfo.announce {
            Some(url) => match Url::parse(url) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                    Some(url)
                }
                _ => {
                    log::warn!("Ignoring unsupported tracker {}", url);
                    None
                }
            },
            None => None,
        };

        // create info hash as a last step
        let info_hash = metainfo.create_info_hash()?;

        Ok(Self {
            name: metainfo.info.name,
            info_hash,
            pieces: metainfo.info.pieces,
            piece_len: metainfo.info.piece_len,
            structure,
            announce,
        })
    }

    /// Returns the number of pieces in this torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }
}

/// Returns whether the string can be used as a single component of a path
/// under the download directory.
fn is_valid_path_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(&['/', '\\'][..])
}

/// Contains the types that we directly deserialize into, but is not to be used
/// by the rest of the crate, as the validity of the parsed structure is not
/// ensured at this level. The semantic validation happens in the [`Metainfo`]
/// type, which is essentially a mapping of [`raw::Metainfo`], but with semantic
/// requirements encoded in the type system..
mod raw {
    use sha1::{Digest, Sha1};

    use super::{Result, Sha1Hash};

    #[derive(Debug, Deserialize)]
    pub struct Metainfo {
        pub info: Info,
        pub announce: Option<String>,
    }

    impl Metainfo {
        /// Creates a SHA-1 hash of the encoded `info` field's value.
        pub fn create_info_hash(&self) -> Result<Sha1Hash> {
            let info = serde_bencode::to_bytes(&self.info)?;
            let digest = Sha1::digest(&info);
            let mut info_hash = [0; 20];
            info_hash.copy_from_slice(&digest);
            Ok(info_hash)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Info {
        pub name: String,
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        pub piece_len: u32,
        #[serde(rename = "length")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub len: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub files: Option<Vec<File>>,
        /// This is not currently used but needs to be kept in here so that we
        /// can encode back a valid info hash for hashing.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub private: Option<u8>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct File {
        pub path: Vec<String>,
        #[serde(rename = "length")]
        pub len: u64,
    }
}
