use std::io::{self, Read};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::bitfield::Bitfield;

// All messages is length-prefixed messages
// According the document, All integers sent in the protocol are encoded as four bytes big-endian, which is u32.
// https://www.bittorrent.org/beps/bep_0003.html#peer-protocol
const LENGTH_PREFIX_LEN: usize = 4;

/// A zero length prefix, sent to keep an idle connection open.
pub const KEEP_ALIVE: [u8; LENGTH_PREFIX_LEN] = [0; LENGTH_PREFIX_LEN];

// Large enough for a 1 MiB block plus the piece header.
pub const DEFAULT_MAX_FRAME_LEN: usize = (1 << 20) + 9;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Expected {expected:?} message but got {actual:?}")]
    UnexpectedId {
        expected: MessageId,
        actual: MessageId,
    },
    #[error("Invalid payload length {0}")]
    InvalidPayloadLength(usize),
    #[error("Expected piece index {expected} but got {actual}")]
    IndexMismatch { expected: u32, actual: u32 },
    #[error("Block offset {begin} is outside a piece of {len} bytes")]
    OffsetOutOfBounds { begin: usize, len: usize },
    #[error("Block of {data_len} bytes at offset {begin} overflows a piece of {len} bytes")]
    DataOutOfBounds {
        begin: usize,
        data_len: usize,
        len: usize,
    },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown message ID {}", value),
            )),
        }
    }
}

impl From<MessageId> for u8 {
    fn from(id: MessageId) -> Self {
        id as u8
    }
}

/// A peer wire message. The payload is carried as is, its layout belongs to
/// whoever handles the message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    KeepAlive,
    Message(Message),
}

impl Message {
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn choke() -> Self {
        Self::new(MessageId::Choke, Vec::new())
    }

    pub fn unchoke() -> Self {
        Self::new(MessageId::Unchoke, Vec::new())
    }

    pub fn interested() -> Self {
        Self::new(MessageId::Interested, Vec::new())
    }

    pub fn not_interested() -> Self {
        Self::new(MessageId::NotInterested, Vec::new())
    }

    pub fn have(piece_index: u32) -> Self {
        Self::new(MessageId::Have, piece_index.to_be_bytes().to_vec())
    }

    pub fn bitfield(bitfield: &Bitfield) -> Self {
        Self::new(MessageId::Bitfield, bitfield.as_bytes().to_vec())
    }

    pub fn request(piece_index: u32, begin: u32, length: u32) -> Self {
        Self::new(MessageId::Request, block_payload(piece_index, begin, length))
    }

    pub fn cancel(piece_index: u32, begin: u32, length: u32) -> Self {
        Self::new(MessageId::Cancel, block_payload(piece_index, begin, length))
    }

    /// `length || id || payload`, where `length` counts the id byte.
    ///
    /// Fails with `InvalidInput` when the payload is too large for the 4-byte
    /// length prefix.
    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + self.message_length());
        self.write_to(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Reads one frame, consuming exactly the bytes it announces.
    ///
    /// Errors of the underlying reader, short reads included, are returned as
    /// they are. A message id outside the protocol is only reported once the
    /// whole frame has been read so the stream stays aligned. Extension
    /// messages such as port (9) or extended (20) therefore come back as
    /// `InvalidData` errors which the caller may skip before reading on.
    ///
    /// The payload buffer grows with the bytes actually received, so a bogus
    /// length prefix cannot force a large allocation. Use [`MessageCodec`] to
    /// cap the frame size itself.
    pub fn read<R: Read + ?Sized>(r: &mut R) -> io::Result<Frame> {
        let mut length_buf = [0u8; LENGTH_PREFIX_LEN];
        r.read_exact(&mut length_buf)?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length == 0 {
            return Ok(Frame::KeepAlive);
        }

        let mut id_buf = [0u8; 1];
        r.read_exact(&mut id_buf)?;
        let mut payload = Vec::new();
        Read::take(&mut *r, (length - 1) as u64).read_to_end(&mut payload)?;
        check_payload_len(&payload, length - 1)?;

        let id = MessageId::try_from(id_buf[0])?;
        Ok(Frame::Message(Message::new(id, payload)))
    }

    /// Same as [`Message::read`] over an async stream.
    pub async fn read_async<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<Frame> {
        let length = r.read_u32().await? as usize;

        if length == 0 {
            return Ok(Frame::KeepAlive);
        }

        let id = r.read_u8().await?;
        let mut payload = Vec::new();
        AsyncReadExt::take(&mut *r, (length - 1) as u64)
            .read_to_end(&mut payload)
            .await?;
        check_payload_len(&payload, length - 1)?;

        let id = MessageId::try_from(id)?;
        Ok(Frame::Message(Message::new(id, payload)))
    }

    pub fn parse_have(&self) -> Result<u32, MessageError> {
        self.expect_id(MessageId::Have)?;
        let bytes: [u8; 4] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| MessageError::InvalidPayloadLength(self.payload.len()))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Copies the block carried by a piece message into `buf`, the buffer of
    /// piece `index`, returning how many bytes were written.
    pub fn parse_piece(&self, index: u32, buf: &mut [u8]) -> Result<usize, MessageError> {
        self.expect_id(MessageId::Piece)?;
        if self.payload.len() < 8 {
            return Err(MessageError::InvalidPayloadLength(self.payload.len()));
        }

        let mut header = &self.payload[..8];
        let parsed_index = header.get_u32();
        if parsed_index != index {
            return Err(MessageError::IndexMismatch {
                expected: index,
                actual: parsed_index,
            });
        }
        let begin = header.get_u32() as usize;
        if begin >= buf.len() {
            return Err(MessageError::OffsetOutOfBounds {
                begin,
                len: buf.len(),
            });
        }
        let data = &self.payload[8..];
        if begin + data.len() > buf.len() {
            return Err(MessageError::DataOutOfBounds {
                begin,
                data_len: data.len(),
                len: buf.len(),
            });
        }

        buf[begin..begin + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn expect_id(&self, expected: MessageId) -> Result<(), MessageError> {
        if self.id != expected {
            return Err(MessageError::UnexpectedId {
                expected,
                actual: self.id,
            });
        }
        Ok(())
    }

    // 1 byte for the ID + payload
    fn message_length(&self) -> usize {
        1 + self.payload.len()
    }

    fn write_to(&self, dst: &mut BytesMut) -> io::Result<()> {
        let length = length_prefix(self.message_length())?;
        dst.reserve(LENGTH_PREFIX_LEN + self.message_length());
        dst.put_u32(length);
        dst.put_u8(self.id.into());
        dst.extend_from_slice(&self.payload);
        Ok(())
    }
}

fn length_prefix(length: usize) -> io::Result<u32> {
    u32::try_from(length).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Message of length {} does not fit the length prefix", length),
        )
    })
}

fn check_payload_len(payload: &[u8], expected: usize) -> io::Result<()> {
    if payload.len() < expected {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Stream ended {} bytes into a {} byte payload", payload.len(), expected),
        ));
    }
    Ok(())
}

fn block_payload(piece_index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(12);
    buffer.extend_from_slice(&piece_index.to_be_bytes());
    buffer.extend_from_slice(&begin.to_be_bytes());
    buffer.extend_from_slice(&length.to_be_bytes());
    buffer
}

/// Frames messages for `tokio_util::codec::Framed` transports.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst)
    }
}

impl Encoder<Frame> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::KeepAlive => {
                dst.extend_from_slice(&KEEP_ALIVE);
                Ok(())
            }
            Frame::Message(message) => message.write_to(dst),
        }
    }
}

impl Decoder for MessageCodec {
    type Error = io::Error;
    type Item = Frame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None); // Not enough data for a length prefix
        }

        // length include the message ID and payload
        let length = (&src[..LENGTH_PREFIX_LEN]).get_u32() as usize;
        if length > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame of length {} exceeds {}", length, self.max_frame_len),
            ));
        }
        if src.len() < LENGTH_PREFIX_LEN + length {
            src.reserve(LENGTH_PREFIX_LEN + length - src.len());
            return Ok(None); // Not enough data for the full message
        }
        src.advance(LENGTH_PREFIX_LEN);

        if length == 0 {
            return Ok(Some(Frame::KeepAlive));
        }
        let id = src.get_u8();
        let payload = src.split_to(length - 1).to_vec();
        let id = MessageId::try_from(id)?;
        Ok(Some(Frame::Message(Message::new(id, payload))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::io::Cursor;
    use tokio_util::codec::{Framed, FramedRead};

    const ALL_IDS: [MessageId; 9] = [
        MessageId::Choke,
        MessageId::Unchoke,
        MessageId::Interested,
        MessageId::NotInterested,
        MessageId::Have,
        MessageId::Bitfield,
        MessageId::Request,
        MessageId::Piece,
        MessageId::Cancel,
    ];

    #[test]
    fn test_serialize() {
        let message = Message::new(MessageId::Unchoke, b"test payload".to_vec());

        let serialized = message.serialize().unwrap();

        assert_eq!(&serialized[..4], &13u32.to_be_bytes());
        assert_eq!(serialized[4], 1);
        assert_eq!(&serialized[5..], b"test payload");
    }

    #[test]
    fn test_serialize_without_payload() {
        assert_eq!(Message::interested().serialize().unwrap(), vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_read() {
        let serialized = vec![
            0x00, 0x00, 0x00, 0x0D, // Length prefix: 13
            0x01, // Message ID: 1
            0x74, 0x65, 0x73, 0x74, 0x20, 0x70, 0x61, 0x79, 0x6C, 0x6F, 0x61, 0x64, // "test payload"
        ];
        let mut reader = Cursor::new(serialized);

        let frame = Message::read(&mut reader).unwrap();

        assert_eq!(
            frame,
            Frame::Message(Message::new(MessageId::Unchoke, b"test payload".to_vec()))
        );
        assert_eq!(reader.position(), 17);
    }

    #[test]
    fn test_round_trip_every_id() {
        for id in ALL_IDS {
            let message = Message::new(id, vec![u8::from(id); id as usize]);
            let frame = Message::read(&mut Cursor::new(message.serialize().unwrap())).unwrap();
            assert_eq!(frame, Frame::Message(message));
        }
    }

    #[test]
    fn test_read_consecutive_messages() {
        let mut stream = Message::have(3).serialize().unwrap();
        stream.extend_from_slice(&KEEP_ALIVE);
        stream.extend(Message::request(1, 16384, 16384).serialize().unwrap());
        let mut reader = Cursor::new(stream);

        assert_eq!(Message::read(&mut reader).unwrap(), Frame::Message(Message::have(3)));
        assert_eq!(Message::read(&mut reader).unwrap(), Frame::KeepAlive);
        assert_eq!(
            Message::read(&mut reader).unwrap(),
            Frame::Message(Message::request(1, 16384, 16384))
        );
    }

    #[test]
    fn test_keep_alive_consumes_four_bytes() {
        let mut reader = Cursor::new(vec![0, 0, 0, 0, 0xAA, 0xBB]);

        let frame = Message::read(&mut reader).unwrap();

        assert_eq!(frame, Frame::KeepAlive);
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn test_short_reads_surface_stream_error() {
        let truncated: [&[u8]; 4] = [
            &[],
            &[0, 0],
            &[0, 0, 0, 5],
            &[0, 0, 0, 5, 4, 0, 0],
        ];
        for bytes in truncated {
            let err = Message::read(&mut Cursor::new(bytes)).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        }
    }

    #[test]
    fn test_unknown_id_consumes_whole_frame() {
        let mut stream = vec![0, 0, 0, 3, 20, 0xFF, 0xFF];
        stream.extend(Message::choke().serialize().unwrap());
        let mut reader = Cursor::new(stream);

        let err = Message::read(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(reader.position(), 7);
        assert_eq!(Message::read(&mut reader).unwrap(), Frame::Message(Message::choke()));
    }

    #[test]
    fn test_extension_messages_can_be_skipped() {
        // port (9) and extended (20) messages between two known ones
        let mut stream = Message::unchoke().serialize().unwrap();
        stream.extend_from_slice(&[0, 0, 0, 3, 9, 0x1A, 0xE1]);
        stream.extend_from_slice(&[0, 0, 0, 4, 20, 0, b'd', b'e']);
        stream.extend(Message::have(1).serialize().unwrap());
        let mut reader = Cursor::new(stream);

        let mut frames = Vec::new();
        loop {
            match Message::read(&mut reader) {
                Ok(frame) => frames.push(frame),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(
            frames,
            vec![
                Frame::Message(Message::unchoke()),
                Frame::Message(Message::have(1)),
            ]
        );
    }

    #[test]
    fn test_huge_length_prefix_on_short_stream() {
        let bytes: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 7, 1, 2, 3];
        let err = Message::read(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_huge_length_prefix_on_short_stream_async() {
        let mut bytes: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 7, 1, 2, 3];
        let err = Message::read_async(&mut bytes).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_length_prefix_bounds() {
        assert_eq!(length_prefix(13).unwrap(), 13);
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_length_prefix_rejects_oversized_message() {
        let err = length_prefix(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_read_async() {
        let mut stream = KEEP_ALIVE.to_vec();
        stream.extend(Message::cancel(2, 0, 10).serialize().unwrap());
        let mut reader = stream.as_slice();

        assert_eq!(Message::read_async(&mut reader).await.unwrap(), Frame::KeepAlive);
        assert_eq!(
            Message::read_async(&mut reader).await.unwrap(),
            Frame::Message(Message::cancel(2, 0, 10))
        );
        let err = Message::read_async(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_framed_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = Framed::new(client, MessageCodec::default());
        let mut server = Framed::new(server, MessageCodec::default());

        let piece = Message::new(MessageId::Piece, (0u8..100).collect());
        client.send(Frame::KeepAlive).await.unwrap();
        client.send(Message::interested()).await.unwrap();
        client.send(piece.clone()).await.unwrap();

        assert_eq!(server.next().await.unwrap().unwrap(), Frame::KeepAlive);
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Frame::Message(Message::interested())
        );
        assert_eq!(server.next().await.unwrap().unwrap(), Frame::Message(piece));
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let mut codec = MessageCodec::default();
        let serialized = Message::have(7).serialize().unwrap();
        let mut src = BytesMut::new();

        src.extend_from_slice(&serialized[..3]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&serialized[3..6]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&serialized[6..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::Message(Message::have(7)))
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut codec = MessageCodec::new(16);
        let mut src = BytesMut::from(&[0u8, 0, 0, 17][..]);
        let err = codec.decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_framed_read_truncated_stream() {
        let bytes: &[u8] = &[0, 0, 0, 5, 4, 0];
        let mut frames = FramedRead::new(bytes, MessageCodec::default());
        assert!(frames.next().await.unwrap().is_err());
    }

    #[test]
    fn test_parse_have() {
        assert_eq!(Message::have(4).parse_have().unwrap(), 4);
        assert!(matches!(
            Message::new(MessageId::Have, vec![0, 0, 4]).parse_have(),
            Err(MessageError::InvalidPayloadLength(3))
        ));
        assert!(matches!(
            Message::choke().parse_have(),
            Err(MessageError::UnexpectedId { .. })
        ));
    }

    #[test]
    fn test_parse_piece() {
        let mut payload = vec![0, 0, 0, 4, 0, 0, 0, 2];
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let message = Message::new(MessageId::Piece, payload);
        let mut buf = vec![0u8; 10];

        let n = message.parse_piece(4, &mut buf).unwrap();

        assert_eq!(n, 3);
        assert_eq!(buf, vec![0, 0, 0xAA, 0xBB, 0xCC, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_piece_errors() {
        let mut buf = vec![0u8; 10];

        let wrong_index = Message::new(MessageId::Piece, vec![0, 0, 0, 6, 0, 0, 0, 0, 1]);
        assert!(matches!(
            wrong_index.parse_piece(4, &mut buf),
            Err(MessageError::IndexMismatch {
                expected: 4,
                actual: 6
            })
        ));

        let bad_offset = Message::new(MessageId::Piece, vec![0, 0, 0, 4, 0, 0, 0, 12, 1]);
        assert!(matches!(
            bad_offset.parse_piece(4, &mut buf),
            Err(MessageError::OffsetOutOfBounds { begin: 12, len: 10 })
        ));

        let mut overflow = vec![0, 0, 0, 4, 0, 0, 0, 8];
        overflow.extend_from_slice(&[1, 2, 3]);
        let overflow = Message::new(MessageId::Piece, overflow);
        assert!(matches!(
            overflow.parse_piece(4, &mut buf),
            Err(MessageError::DataOutOfBounds { .. })
        ));

        let short = Message::new(MessageId::Piece, vec![0, 0, 0, 4]);
        assert!(matches!(
            short.parse_piece(4, &mut buf),
            Err(MessageError::InvalidPayloadLength(4))
        ));

        assert!(matches!(
            Message::have(4).parse_piece(4, &mut buf),
            Err(MessageError::UnexpectedId { .. })
        ));
    }

    #[test]
    fn test_bitfield_message() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set_piece(0);
        bitfield.set_piece(9);
        let message = Message::bitfield(&bitfield);
        assert_eq!(message.id, MessageId::Bitfield);
        assert_eq!(message.payload, vec![0b1000_0000, 0b0100_0000]);
    }
}
