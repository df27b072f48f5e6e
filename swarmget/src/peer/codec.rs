use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    peer::error::{HandshakeError, PeerError},
    Bitfield, BlockInfo,
};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of the handshake on the wire: the protocol string length
/// prefix, the protocol string, the reserved bytes, the info hash and the peer
/// id.
pub(crate) const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Messages longer than this are rejected without buffering them, as no
/// legitimate message (a block or the bitfield of any sane torrent) comes
/// close.
pub(crate) const MAX_MESSAGE_LEN: usize = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connetion is aborted.
    pub prot: [u8; 19],
    /// A reserved field, currently all zeros. This is where the client's
    /// supported extensions are announced.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), PeerError> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(prot, PROTOCOL_STRING.as_bytes());

        buf.reserve(HANDSHAKE_LEN);
        // protocol length prefix
        buf.put_u8(prot.len() as u8);
        // payload
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, PeerError> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the length prefix can be checked before the rest of the handshake
        // arrives, which lets us drop non-bittorrent connections early
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(HandshakeError::InvalidProtocol.into());
        }

        // check that we got the full payload in the buffer, but don't consume
        // anything until we do
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        buf.advance(1);

        // protocol string
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(HandshakeError::InvalidProtocol.into());
        }
        // reserved field
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        // info hash
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        // peer id
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, PeerError> {
        match self.decode(buf)? {
            Some(handshake) => Ok(Some(handshake)),
            None if buf.is_empty() => Ok(None),
            // peer hung up before sending the whole handshake
            None => {
                log::debug!(
                    "Connection closed after {} handshake byte(s)",
                    buf.len()
                );
                buf.clear();
                Err(HandshakeError::ConnectionClosed.into())
            }
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Block as u8 => Ok(Block),
            k if k == Cancel as u8 => Ok(Cancel),
            k => Err(PeerError::UnsupportedMessage(k)),
        }
    }
}

/// The messages of the peer wire protocol, apart from the handshake.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    Request(BlockInfo),
    /// The "piece" message of the protocol, which carries the data of a single
    /// block.
    Block {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the ID of the message, if it has one (e.g. keep alive doesn't).
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), PeerError> {
        use Message::*;
        match msg {
            KeepAlive => {
                // message length prefix, no id and no payload
                buf.put_u32(0);
            }
            Bitfield(bitfield) => {
                // message length prefix: 1 byte message id and n byte bitfield
                //
                // NOTE: take the length of the underlying storage to get the
                // number of _bytes_, as `bitfield.len()` returns the number of
                // _bits_
                let raw = bitfield.as_raw_slice();
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(raw);
            }
            Choke => encode_id_only(MessageId::Choke, buf),
            Unchoke => encode_id_only(MessageId::Unchoke, buf),
            Interested => encode_id_only(MessageId::Interested, buf),
            NotInterested => encode_id_only(MessageId::NotInterested, buf),
            Have { piece_index } => {
                // message length prefix:
                // 1 byte message id and 4 byte piece index
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Request(block) => {
                encode_block_info(MessageId::Request, &block, buf)
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                // message length prefix:
                // 1 byte message id, 4 byte piece index, 4 byte offset, and
                // n byte block
                buf.reserve(4 + 9 + data.len());
                buf.put_u32(1 + 4 + 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => encode_block_info(MessageId::Cancel, &block, buf),
        }

        Ok(())
    }
}

/// Encodes the messages that consist of only the length prefix and the id
/// (choke, unchoke, interested, not interested).
fn encode_id_only(id: MessageId, buf: &mut BytesMut) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

/// Encodes the request and cancel messages, which have the same format.
fn encode_block_info(id: MessageId, block: &BlockInfo, buf: &mut BytesMut) {
    // message length prefix:
    // 1 byte message id, 4 byte piece index, 4 byte offset, 4 byte length
    buf.put_u32(1 + 4 + 4 + 4);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, PeerError> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek the length so that the buffer is left intact until the whole
        // frame has arrived
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let msg_len = u32::from_be_bytes(prefix) as usize;

        // the message length is only 0 if this is a keep alive message (all
        // other message types have at least one more field, the message id)
        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if msg_len > MAX_MESSAGE_LEN {
            log::warn!("Message length {} exceeds maximum", msg_len);
            return Err(PeerError::MalformedMessage);
        }

        // check that we got the full payload in the buffer
        if buf.len() < 4 + msg_len {
            // hint to the framed reader how much more we need
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        // split off the frame so that an invalid payload can never make us
        // read into the next message
        let mut frame = buf.split_to(msg_len);
        let msg_id = MessageId::try_from(frame.get_u8())?;
        let payload_len = frame.remaining();

        let msg = match msg_id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => {
                if payload_len != 0 {
                    return Err(PeerError::MalformedMessage);
                }
                match msg_id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(PeerError::MalformedMessage);
                }
                let piece_index = frame.get_u32();
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            MessageId::Request => {
                Message::Request(decode_block_info(&mut frame)?)
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(PeerError::MalformedMessage);
                }
                let piece_index = frame.get_u32();
                let offset = frame.get_u32();
                // the remainder of the frame is the block
                let data = frame.to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => Message::Cancel(decode_block_info(&mut frame)?),
        };

        Ok(Some(msg))
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, PeerError> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                // the connection was closed mid-frame: the partial frame is
                // dropped and the message stream ends
                if !buf.is_empty() {
                    log::debug!(
                        "Discarding {} byte(s) of partial message",
                        buf.len()
                    );
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

/// Decodes the payload of a request or cancel message.
fn decode_block_info(frame: &mut BytesMut) -> Result<BlockInfo, PeerError> {
    if frame.remaining() != 12 {
        return Err(PeerError::MalformedMessage);
    }
    let piece_index = frame.get_u32() as usize;
    let offset = frame.get_u32();
    let len = frame.get_u32();
    Ok(BlockInfo {
        piece_index,
        offset,
        len,
    })
}
