//! The BitTorrent handshake and peer message codecs, bit-compatible with
//! BEP 3.
//!
//! After the 68-byte handshake every message is framed as
//! `<length: u32 big endian><payload>`, where a length of zero is a
//! keep-alive and the first payload byte otherwise identifies the message.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// No legitimate message frame is larger than a block message plus its
/// header, or a bitfield of a very large torrent. Anything above this is
/// treated as a hostile length prefix.
const MAX_FRAME_LEN: u32 = 0x10_0000;

fn invalid_data(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what)
}

/// The handshake exchanged right after the TCP connection is established.
#[derive(Clone, Copy)]
pub(crate) struct Handshake {
    /// The protocol string, always "BitTorrent protocol".
    pub prot: [u8; 19],
    /// Extension bits. We send all zeros; whatever the peer sends is
    /// retained but not interpreted.
    pub reserved: [u8; 8],
    /// The torrent's info hash.
    pub info_hash: Sha1Hash,
    /// The sender's arbitrary 20 byte peer id.
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
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .field("reserved", &self.reserved)
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
        buf.reserve(68);
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
        // the protocol string length prefix can be rejected before the rest
        // of the handshake arrives
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(invalid_data("handshake protocol string length"));
        }
        if buf.len() < 68 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(invalid_data("handshake protocol string"));
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

/// The id byte of each peer message, as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
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
            _ => Err(invalid_data("unknown message id")),
        }
    }
}

/// A message of the peer wire protocol.
#[derive(Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// The message's wire id, or `None` for a keep-alive, which has no id.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Returns the canonical wire bytes of a bitfield: big endian bytes, most
/// significant bit first, trailing padding bits zero.
pub(crate) fn encode_bitfield(bitfield: &Bitfield) -> Vec<u8> {
    let mut bitfield = bitfield.clone();
    bitfield.set_uninitialized(false);
    bitfield.as_raw_slice().to_vec()
}

/// Validates and truncates a received bitfield to the torrent's piece count.
///
/// The wire bitfield must be exactly `ceil(piece_count / 8)` bytes and its
/// trailing padding bits must be zero.
pub(crate) fn decode_bitfield(
    mut bitfield: Bitfield,
    piece_count: usize,
) -> Result<Bitfield, &'static str> {
    if bitfield.len() != (piece_count + 7) / 8 * 8 {
        return Err("bitfield length mismatch");
    }
    if bitfield[piece_count..].any() {
        return Err("bitfield has nonzero trailing bits");
    }
    bitfield.truncate(piece_count);
    Ok(bitfield)
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
            Choke | Unchoke | Interested | NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("id-less flag message") as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let bytes = encode_bitfield(&bitfield);
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
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
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        use std::convert::TryFrom;

        if buf.len() < 4 {
            return Ok(None);
        }
        let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if msg_len > MAX_FRAME_LEN {
            return Err(invalid_data("message length too large"));
        }
        if buf.len() < 4 + msg_len as usize {
            // a partial frame, reserve what we know is coming
            buf.reserve(4 + msg_len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = buf.split_to(msg_len as usize);
        let id = MessageId::try_from(payload.get_u8())?;
        let payload_len = payload.len();

        let msg = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => {
                if payload_len != 0 {
                    return Err(invalid_data("flag message with payload"));
                }
                match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(invalid_data("have payload length"));
                }
                Message::Have {
                    piece_index: payload.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_slice(&payload))
            }
            MessageId::Request => {
                if payload_len != 12 {
                    return Err(invalid_data("request payload length"));
                }
                Message::Request(BlockInfo {
                    piece_index: payload.get_u32() as PieceIndex,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                })
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(invalid_data("piece payload length"));
                }
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
            MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(invalid_data("cancel payload length"));
                }
                Message::Cancel(BlockInfo {
                    piece_index: payload.get_u32() as PieceIndex,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                })
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{bitvec, Msb0};
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: Message) -> Message {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let debug = format!("{:?}", msg);
        codec.encode(msg, &mut buf).expect("encode");
        let decoded = codec
            .decode(&mut buf)
            .expect("decode")
            .unwrap_or_else(|| panic!("partial frame for {}", debug));
        assert!(buf.is_empty(), "leftover bytes after {}", debug);
        decoded
    }

    #[test]
    fn test_message_roundtrips() {
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
        assert_eq!(roundtrip(Message::Choke), Message::Choke);
        assert_eq!(roundtrip(Message::Unchoke), Message::Unchoke);
        assert_eq!(roundtrip(Message::Interested), Message::Interested);
        assert_eq!(
            roundtrip(Message::NotInterested),
            Message::NotInterested
        );
        assert_eq!(
            roundtrip(Message::Have { piece_index: 42 }),
            Message::Have { piece_index: 42 }
        );

        let block = BlockInfo {
            piece_index: 1,
            offset: 0x4000,
            len: 0x4000,
        };
        assert_eq!(roundtrip(Message::Request(block)), Message::Request(block));
        assert_eq!(roundtrip(Message::Cancel(block)), Message::Cancel(block));

        let data: Vec<u8> = (0u8..=255).cycle().take(0x4000).collect();
        assert_eq!(
            roundtrip(Message::Block {
                piece_index: 3,
                offset: 0x8000,
                data: data.clone(),
            }),
            Message::Block {
                piece_index: 3,
                offset: 0x8000,
                data,
            }
        );
    }

    #[test]
    fn test_bitfield_roundtrip() {
        // a 12 bit bitfield with bits 0, 3 and 11 set comes back padded to
        // whole bytes; truncating restores the original
        let mut bitfield = bitvec![u8, Msb0; 0; 12];
        bitfield.set(0, true);
        bitfield.set(3, true);
        bitfield.set(11, true);

        let decoded = roundtrip(Message::Bitfield(bitfield.clone()));
        match decoded {
            Message::Bitfield(raw) => {
                assert_eq!(raw.len(), 16);
                let truncated = decode_bitfield(raw, 12).expect("valid");
                assert_eq!(truncated, bitfield);
            }
            other => panic!("expected bitfield, got {:?}", other),
        }
    }

    #[test]
    fn test_bitfield_wire_layout_roundtrips_across_lengths() {
        for len in (0..64).chain([100, 1000, 9999, 10000]) {
            let mut bitfield = bitvec![u8, Msb0; 0; len];
            // set a deterministic pattern
            for i in (0..len).step_by(3) {
                bitfield.set(i, true);
            }
            let bytes = encode_bitfield(&bitfield);
            assert_eq!(bytes.len(), (len + 7) / 8);
            let decoded =
                decode_bitfield(Bitfield::from_slice(&bytes), len).unwrap();
            assert_eq!(decoded, bitfield, "length {}", len);
        }
    }

    #[test]
    fn test_bitfield_nonzero_trailing_bits_rejected() {
        // 10 pieces in 2 bytes, but the last (padding) bit is set
        let bytes = [0xff, 0b0110_0001];
        assert!(decode_bitfield(Bitfield::from_slice(&bytes), 10).is_err());
        // correct padding passes
        let bytes = [0xff, 0b0110_0000];
        assert!(decode_bitfield(Bitfield::from_slice(&bytes), 10).is_ok());
        // wrong byte count is rejected outright
        assert!(decode_bitfield(Bitfield::from_slice(&bytes), 20).is_err());
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::Have { piece_index: 7 },
                &mut buf,
            )
            .unwrap();

        // feed the frame one byte at a time; only the last byte completes it
        let bytes = buf.split().freeze();
        let mut partial = BytesMut::new();
        for (i, byte) in bytes.iter().enumerate() {
            partial.put_u8(*byte);
            let result = codec.decode(&mut partial).unwrap();
            if i < bytes.len() - 1 {
                assert!(result.is_none(), "byte {}", i);
            } else {
                assert_eq!(result, Some(Message::Have { piece_index: 7 }));
            }
        }
    }

    #[test]
    fn test_invalid_frames_are_rejected() {
        let mut codec = PeerCodec;

        // unknown message id
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(14);
        assert!(codec.decode(&mut buf).is_err());

        // hostile length prefix
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(codec.decode(&mut buf).is_err());

        // truncated request payload
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_handshake_roundtrip() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([0xab; 20], *b"-FS0001-012345678901");
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = codec.decode(&mut buf).unwrap().expect("full handshake");
        assert_eq!(decoded.prot, handshake.prot);
        assert_eq!(decoded.reserved, handshake.reserved);
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
    }

    #[test]
    fn test_handshake_bad_protocol_rejected() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(18);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"BitTorrent Protocol");
        buf.put_slice(&[0; 48]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
