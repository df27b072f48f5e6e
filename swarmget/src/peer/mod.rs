#[macro_use]
mod peer_log;
pub(crate) mod codec;
mod error;

use std::{net::SocketAddr, sync::Arc};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedParts};

use crate::{store::PieceStore, torrent::TorrentContext, BlockInfo, PeerId};
use codec::*;
pub use error::{HandshakeError, PeerError};
use error::Result;

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum State {
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and while exchanging
    /// the initial BitTorrent handshake.
    Handshaking,
    /// This is the normal state of a peer session, in which any messages, apart
    /// from the 'handshake', may be exchanged.
    Active,
    /// The connection is closed, whether because the download is done, the
    /// peer has nothing more for us, or because of an error.
    Closed,
}

// The status of a peer session.
//
// We start off choked and, as we only download, interested in the peer.
#[derive(Clone, Copy, Debug)]
struct Status {
    // If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    // If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    // If peer is interested in us, they mean to download pieces that we have.
    is_peer_interested: bool,
    // We keep at most one block request outstanding. This is set when
    // a request is sent and cleared when that block arrives or when we're
    // choked, as a choking peer drops our outstanding requests.
    outstanding_request: Option<BlockInfo>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: true,
            is_peer_interested: false,
            outstanding_request: None,
        }
    }
}

/// Statistics of a single peer session.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SessionStats {
    /// The number of blocks received from the peer.
    pub blocks_received: usize,
    /// The number of block payload bytes received from the peer.
    pub downloaded_payload: u64,
}

type PeerSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// Whether the session should keep processing messages after one was handled.
enum Flow {
    Continue,
    Close,
}

pub(crate) struct PeerSession {
    /// Shared information of the torrent, including the piece store.
    torrent: Arc<TorrentContext>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The current state of the session.
    state: State,
    /// Session related information.
    status: Status,
    /// Peer's 20 byte BitTorrent id, set after a successful handshake.
    peer_id: Option<PeerId>,
    stats: SessionStats,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(torrent: Arc<TorrentContext>, addr: SocketAddr) -> Self {
        Self {
            torrent,
            addr,
            state: State::Connecting,
            status: Status::default(),
            peer_id: None,
            stats: SessionStats::default(),
        }
    }

    /// Returns the current state of the session.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Connects to the peer and downloads from it until the torrent is
    /// complete, the peer has nothing more that we need, or an error occurs.
    ///
    /// The session is always closed when this returns.
    pub async fn start(&mut self) -> Result<()> {
        peer_info!(self, "Starting session");
        // the transport is owned by the future below, so however it
        // finishes, the connection is closed when it returns
        let result = self.connect_and_run().await;
        self.close(&result);
        result
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        self.state = State::Connecting;
        peer_info!(self, "Connecting");
        let socket = TcpStream::connect(self.addr).await?;
        peer_info!(self, "Connected");

        let socket = self.handshake(socket).await?;
        self.run(socket).await
    }

    async fn handshake(
        &mut self,
        socket: TcpStream,
    ) -> Result<Framed<TcpStream, PeerCodec>> {
        self.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        peer_debug!(self, "Sending handshake");
        socket.send(handshake).await?;

        // receive peer's handshake
        let peer_handshake = match socket.next().await {
            Some(peer_handshake) => peer_handshake?,
            None => {
                peer_info!(self, "Connection closed during handshake");
                return Err(HandshakeError::ConnectionClosed.into());
            }
        };
        peer_debug!(self, "Received handshake: {:?}", peer_handshake);
        // codec should only return handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            peer_info!(self, "Handshake invalid info hash");
            return Err(HandshakeError::InvalidInfoHash.into());
        }
        self.peer_id = Some(peer_handshake.peer_id);

        // now that we have the handshake, we need to switch to the peer
        // message codec (note that we need to keep the buffer from the
        // original codec as it may contain bytes of any potential message the
        // peer may have sent after the handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        self.state = State::Active;
        peer_info!(self, "Session state: {:?}", self.state);

        // a peer may announce its pieces with have messages only
        self.torrent.store.lock().await.add_peer(self.addr);

        let (mut sink, mut stream) = socket.split();
        let mut completed = self.torrent.completed_port.clone();

        // we only download, so we're interested in peer from the start
        peer_debug!(self, "Sending interested");
        sink.send(Message::Interested).await?;

        loop {
            // another session may have finished the torrent while this peer
            // had nothing to send us
            if *completed.borrow() {
                peer_info!(self, "Torrent complete");
                break;
            }

            tokio::select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => {
                            peer_info!(self, "Peer closed the connection");
                            break;
                        }
                    };
                    peer_trace!(self, "Received message {:?}", msg.id());
                    if let Flow::Close = self.handle_msg(msg).await {
                        break;
                    }
                    if let Flow::Close = self.make_request(&mut sink).await? {
                        break;
                    }
                }
                changed = completed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_msg(&mut self, msg: Message) -> Flow {
        match msg {
            Message::KeepAlive => {
                peer_debug!(self, "Peer sent keep alive");
            }
            Message::Bitfield(bitfield) => {
                peer_info!(self, "Peer sent bitfield");
                let mut store = self.torrent.store.lock().await;
                store.register_peer(self.addr, &bitfield);
                if !store.is_interesting(&self.addr) {
                    peer_info!(self, "Peer has no pieces we need");
                }
            }
            Message::Choke => {
                if !self.status.is_choked {
                    peer_info!(self, "Peer choked us");
                    // a choking peer discards our outstanding request, which
                    // is picked up again once it times out
                    self.status.is_choked = true;
                    self.status.outstanding_request = None;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    peer_info!(self, "Peer unchoked us");
                    self.status.is_choked = false;
                }
            }
            Message::Interested => {
                peer_debug!(self, "Peer is interested");
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                peer_debug!(self, "Peer is not interested");
                self.status.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                peer_debug!(self, "Peer has piece {}", piece_index);
                self.torrent
                    .store
                    .lock()
                    .await
                    .update_peer(&self.addr, piece_index as usize);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                peer_trace!(
                    self,
                    "Peer sent piece {} block (offset {}, length {})",
                    piece_index,
                    offset,
                    data.len()
                );
                // a block sent before a choke may arrive after we've made a new
                // request, which is still outstanding then
                match self.status.outstanding_request {
                    Some(block)
                        if block.piece_index == piece_index as usize
                            && block.offset == offset =>
                    {
                        self.status.outstanding_request = None;
                    }
                    _ => {
                        peer_debug!(
                            self,
                            "Piece {} block at offset {} was not requested last",
                            piece_index,
                            offset
                        );
                    }
                }
                self.stats.blocks_received += 1;
                self.stats.downloaded_payload += data.len() as u64;

                let mut store = self.torrent.store.lock().await;
                store.block_received(
                    &self.addr,
                    piece_index as usize,
                    offset,
                    data,
                );
                if store.is_complete() {
                    self.complete(&mut store);
                    return Flow::Close;
                }
            }
            // we don't upload, so these are accepted but ignored
            Message::Request(block) => {
                peer_debug!(self, "Ignoring request for block {}", block);
            }
            Message::Cancel(block) => {
                peer_debug!(self, "Ignoring cancel of block {}", block);
            }
        }
        Flow::Continue
    }

    /// Requests the next block from peer if we're allowed to and no request is
    /// outstanding.
    ///
    /// The session is to be closed once the torrent is complete, after it's
    /// written to disk, or when the peer has no block we can request.
    async fn make_request(&mut self, sink: &mut PeerSink) -> Result<Flow> {
        if self.status.is_choked
            || !self.status.is_interested
            || self.status.outstanding_request.is_some()
        {
            return Ok(Flow::Continue);
        }

        let mut store = self.torrent.store.lock().await;
        if store.is_complete() {
            self.complete(&mut store);
            return Ok(Flow::Close);
        }

        let next = store.next_request(&self.addr);
        // don't hold the store while writing to the socket
        drop(store);
        match next {
            Some(block) => {
                peer_trace!(self, "Requesting block {}", block);
                sink.send(Message::Request(block)).await?;
                self.status.outstanding_request = Some(block);
                Ok(Flow::Continue)
            }
            None => {
                peer_info!(self, "Peer has no more blocks for us");
                Ok(Flow::Close)
            }
        }
    }

    /// Writes the complete torrent to disk and tells the other sessions of the
    /// torrent to close.
    fn complete(&self, store: &mut PieceStore) {
        peer_info!(self, "Torrent complete, writing to disk");
        if let Err(e) = store.flush() {
            // the torrent retries the flush once all sessions are done
            peer_warn!(self, "Failed to write torrent to disk: {}", e);
        }
        // the other sessions may be waiting on their peers
        let _ = self.torrent.completed_chan.send(true);
    }

    fn close(&mut self, result: &Result<()>) {
        debug_assert_ne!(self.state, State::Closed);
        self.state = State::Closed;
        match result {
            Ok(()) => peer_info!(self, "Session closed"),
            Err(e) => peer_warn!(self, "Session closed with error: {}", e),
        }
        peer_info!(
            self,
            "Downloaded {} block(s), {} bytes (peer interested: {}, id: {})",
            self.stats.blocks_received,
            self.stats.downloaded_payload,
            self.status.is_peer_interested,
            self.peer_id
                .map(|id| String::from_utf8_lossy(&id).into_owned())
                .unwrap_or_default()
        );
    }
}
