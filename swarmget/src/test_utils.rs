//! Helpers shared by the tests of the session and torrent modules.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    metainfo::Metainfo,
    peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    storage_info::{FileInfo, FsStructure},
    Bitfield, Sha1Hash,
};

/// Returns a path in the system's temporary directory that is unique to the
/// test and the test process, removing anything left over at that path.
pub(crate) fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("swarmget-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Creates the metainfo of a torrent with files of the given lengths and
/// returns it with the torrent's content.
///
/// A single file torrent's file is named after the torrent, while the files
/// of a multi file torrent are named `file0`, `file1`, etc.
pub(crate) fn make_metainfo(
    name: &str,
    file_lens: &[u64],
    piece_len: u32,
) -> (Metainfo, Vec<u8>) {
    let structure = if let [len] = file_lens {
        FsStructure::File(FileInfo {
            path: name.into(),
            len: *len,
            torrent_offset: 0,
        })
    } else {
        let mut torrent_offset = 0;
        let mut files = Vec::new();
        for (i, len) in file_lens.iter().enumerate() {
            files.push(FileInfo {
                path: format!("file{}", i).into(),
                len: *len,
                torrent_offset,
            });
            torrent_offset += len;
        }
        FsStructure::Archive { files }
    };

    let data: Vec<u8> = (0..structure.download_len())
        .map(|i| (i % 253) as u8)
        .collect();
    let pieces: Vec<u8> = data
        .chunks(piece_len as usize)
        .flat_map(|piece| Sha1::digest(piece).to_vec())
        .collect();

    let mut info_hash = [0; 20];
    info_hash.copy_from_slice(&Sha1::digest(name.as_bytes()));

    let metainfo = Metainfo {
        name: name.to_string(),
        info_hash,
        pieces,
        piece_len,
        structure,
        announce: None,
    };
    (metainfo, data)
}

/// How a seed answers a block request.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Reply {
    /// Sends the requested block, if the seed has its piece.
    Serve,
    /// Drops the request and chokes the peer, then unchokes it after the
    /// pause.
    Choke { pause: Duration },
}

/// A remote peer that serves the blocks of the pieces it has.
pub(crate) struct Seed {
    /// The info hash sent in the seed's handshake.
    pub info_hash: Sha1Hash,
    /// The torrent's content.
    pub data: Vec<u8>,
    pub piece_len: u32,
    /// The pieces the seed serves.
    pub pieces: Bitfield,
    /// The messages sent right after the handshake. If not set, these are the
    /// bitfield of `pieces` and an unchoke.
    pub intro: Option<Vec<Message>>,
    /// The answer to each request, in the order the requests arrive. Requests
    /// past the end of the list are served.
    pub replies: Vec<Reply>,
}

impl Seed {
    /// Creates a seed that has all pieces of the torrent.
    pub fn new(info_hash: Sha1Hash, data: Vec<u8>, piece_len: u32) -> Self {
        let piece_count =
            (data.len() + piece_len as usize - 1) / piece_len as usize;
        Self {
            info_hash,
            data,
            piece_len,
            pieces: Bitfield::repeat(true, piece_count),
            intro: None,
            replies: Vec::new(),
        }
    }
}

/// Starts listening for a single connection on a local port and serves the
/// torrent to it: handshake, the intro messages, then the replies to each
/// request. The connection stays open until the other side hangs up. Returns
/// the address the seed listens on.
pub(crate) async fn spawn_seed(seed: Seed) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = Framed::new(socket, HandshakeCodec);
        match socket.next().await {
            Some(Ok(_)) => {}
            _ => return,
        }
        let handshake = Handshake::new(seed.info_hash, *b"-SD0001-000000000000");
        if socket.send(handshake).await.is_err() {
            return;
        }

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        let mut socket = Framed::from_parts(new_parts);

        let intro = match &seed.intro {
            Some(intro) => intro.clone(),
            None => vec![Message::Bitfield(seed.pieces.clone()), Message::Unchoke],
        };
        for msg in intro {
            if socket.send(msg).await.is_err() {
                return;
            }
        }

        let mut request_count = 0;
        while let Some(Ok(msg)) = socket.next().await {
            let block = match msg {
                Message::Request(block) => block,
                _ => continue,
            };
            let reply = seed
                .replies
                .get(request_count)
                .copied()
                .unwrap_or(Reply::Serve);
            request_count += 1;

            let msgs = match reply {
                Reply::Serve if seed.pieces[block.piece_index] => {
                    let start = block.piece_index * seed.piece_len as usize
                        + block.offset as usize;
                    vec![Message::Block {
                        piece_index: block.piece_index as u32,
                        offset: block.offset,
                        data: seed.data[start..start + block.len as usize]
                            .to_vec(),
                    }]
                }
                Reply::Serve => Vec::new(),
                Reply::Choke { pause } => {
                    if socket.send(Message::Choke).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(pause).await;
                    vec![Message::Unchoke]
                }
            };
            for msg in msgs {
                if socket.send(msg).await.is_err() {
                    return;
                }
            }
        }
    });

    addr
}
