//! Framing codecs for the BitTorrent wire protocol.
//!
//! Two codecs share the TCP stream over a connection's lifetime: the fixed
//! size [`HandshakeCodec`] for the initial exchange and the length prefixed
//! [`PeerCodec`] for everything after. The switch preserves the read buffer,
//! as the remote may pipeline messages right behind its handshake.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, MAX_BLOCK_LEN};

/// The protocol string of the original BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is always 1 + 19 + 8 + 20 + 20 bytes.
pub(crate) const HANDSHAKE_LEN: usize = 68;

/// No peer message may be longer than a maximum size block message: 4 bytes
/// offset, 4 bytes index, 1 byte id, and the block data.
const MAX_FRAME_LEN: u32 = MAX_BLOCK_LEN + 9;

/// The fixed 68 byte message that opens every connection:
/// `<1><"BitTorrent protocol"><8 reserved><20 info hash><20 peer id>`.
#[derive(Clone, Copy, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, always [`PROTOCOL_STRING`] in valid handshakes.
    pub prot: [u8; 19],
    /// Reserved extension bits. We send all zeros and ignore the remote's.
    pub reserved: [u8; 8],
    /// The identity of the torrent the connection is for.
    pub info_hash: Sha1Hash,
    /// The remote's self-assigned id.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
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

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("prot", &String::from_utf8_lossy(&self.prot))
            .field("info_hash", &hex::encode(&self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is checked before waiting for the whole
        // handshake so that garbage is rejected as early as possible
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string length invalid",
            ));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let mut buf = buf.split_to(HANDSHAKE_LEN);
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != *PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string invalid",
            ));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id byte of each message type, as sent on the wire.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum MessageId {
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

impl std::convert::TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> io::Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message id",
            )),
        }
    }
}

/// A message of the peer wire protocol.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    /// A zero length frame, sent to keep the connection from timing out.
    KeepAlive,
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// The message's size on the wire, including the length prefix. Used
    /// for rate accounting.
    pub fn wire_len(&self) -> u64 {
        match self {
            Self::KeepAlive => 4,
            Self::Bitfield(bitfield) => 4 + 1 + bitfield.as_slice().len() as u64,
            Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested => 4 + 1,
            Self::Have { .. } => 4 + 5,
            Self::Request(_) | Self::Cancel(_) => 4 + 13,
            Self::Block { data, .. } => 4 + 9 + data.len() as u64,
        }
    }

    /// The message's wire id, or `None` for the id-less keep alive.
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
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Bitfield(bitfield) => {
                let field = bitfield.as_slice();
                buf.put_u32(1 + field.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(field);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Request(block) => {
                encode_block_info(MessageId::Request, block, buf);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Cancel(block) => {
                encode_block_info(MessageId::Cancel, block, buf);
            }
        }
        Ok(())
    }
}

fn encode_block_info(id: MessageId, block: BlockInfo, buf: &mut BytesMut) {
    buf.put_u32(13);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek the length prefix without consuming it, as the frame may not
        // have fully arrived yet
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(prefix);

        if frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message length over the protocol limit",
            ));
        }
        if buf.len() < 4 + frame_len as usize {
            buf.reserve(4 + frame_len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut frame = buf.split_to(frame_len as usize);
        let id: MessageId = std::convert::TryFrom::try_from(frame.get_u8())?;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                check_body_len(&frame, 4)?;
                Message::Have {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            MessageId::Request => {
                check_body_len(&frame, 12)?;
                Message::Request(decode_block_info(&mut frame))
            }
            MessageId::Block => {
                if frame.len() < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "block message body too short",
                    ));
                }
                let piece_index = frame.get_u32() as PieceIndex;
                let offset = frame.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: frame.to_vec(),
                }
            }
            MessageId::Cancel => {
                check_body_len(&frame, 12)?;
                Message::Cancel(decode_block_info(&mut frame))
            }
        };

        Ok(Some(msg))
    }
}

fn check_body_len(frame: &BytesMut, expected: usize) -> io::Result<()> {
    if frame.len() != expected {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message body length invalid",
        ))
    } else {
        Ok(())
    }
}

fn decode_block_info(frame: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: frame.get_u32() as PieceIndex,
        offset: frame.get_u32(),
        len: frame.get_u32(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::BLOCK_LEN;

    fn round_trip(msg: Message) {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        // the whole frame must have been consumed
        assert!(buf.is_empty());
    }

    #[test]
    fn test_message_round_trips() {
        let block = BlockInfo {
            piece_index: 42,
            offset: 2 * BLOCK_LEN,
            len: BLOCK_LEN,
        };
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have { piece_index: 1234 });
        round_trip(Message::Bitfield(Bitfield::from_vec(vec![
            0b1010_0101,
            0b0000_1111,
        ])));
        round_trip(Message::Request(block));
        round_trip(Message::Cancel(block));
        round_trip(Message::Block {
            piece_index: 42,
            offset: BLOCK_LEN,
            data: (0..255).collect(),
        });
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have { piece_index: 7 }, &mut buf)
            .unwrap();

        // feed the frame one byte at a time; only the last byte completes it
        let encoded = buf.to_vec();
        let mut partial = BytesMut::new();
        for byte in &encoded[..encoded.len() - 1] {
            partial.put_u8(*byte);
            assert_eq!(PeerCodec.decode(&mut partial).unwrap(), None);
        }
        partial.put_u8(encoded[encoded.len() - 1]);
        assert_eq!(
            PeerCodec.decode(&mut partial).unwrap(),
            Some(Message::Have { piece_index: 7 })
        );
    }

    #[test]
    fn test_largest_legal_frame_is_accepted() {
        round_trip(Message::Block {
            piece_index: 0,
            offset: 0,
            data: vec![0xfe; MAX_BLOCK_LEN as usize],
        });
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        buf.put_u8(MessageId::Block as u8);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_message_id_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([0x12; 20], *b"-rp0100-012345678901");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_handshake_bad_protocol_string_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"BitTorrent protocol".to_ascii_uppercase().as_slice());
        buf.put_slice(&[0; 8 + 20 + 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());

        // a wrong protocol string length is rejected from the first byte
        let mut buf = BytesMut::new();
        buf.put_u8(18);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_handshake_partial_is_buffered() {
        let handshake = Handshake::new([0x12; 20], [b'x'; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let encoded = buf.to_vec();

        let mut partial = BytesMut::new();
        partial.put_slice(&encoded[..HANDSHAKE_LEN - 1]);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
        partial.put_u8(encoded[HANDSHAKE_LEN - 1]);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_some());
    }
}
