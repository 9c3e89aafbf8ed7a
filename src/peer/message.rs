use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Largest frame accepted from a peer: a generous block plus headers, or a
/// bitfield for a torrent with millions of pieces.
pub const MAX_FRAME_LENGTH: usize = 1 << 20;

const LENGTH_PREFIX: usize = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke         = 0,
    Unchoke       = 1,
    Interested    = 2,
    NotInterested = 3,
    Have          = 4,
    Bitfield      = 5,
    Request       = 6,
    Piece         = 7,
    Cancel        = 8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bitmap: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A message id this client does not speak; its payload was skipped.
    Unknown { id: u8, length: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    FrameTooLarge(usize),
    #[error("{id:?} payload must be {expected} bytes, got {received}")]
    BadPayloadLength { id: MessageId, expected: usize, received: usize },
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
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
            other => Err(other),
        }
    }
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive | Message::Unknown { .. } => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    /// Pulls one complete frame off the front of `buf`. Returns `Ok(None)`
    /// and leaves `buf` untouched while the frame is still incomplete.
    pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let total_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if total_length > MAX_FRAME_LENGTH {
            return Err(MessageError::FrameTooLarge(total_length));
        }
        if buf.len() < LENGTH_PREFIX + total_length {
            buf.reserve(LENGTH_PREFIX + total_length - buf.len());
            return Ok(None);
        }
        buf.advance(LENGTH_PREFIX);
        if total_length == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = buf.split_to(total_length);
        let raw_id = payload.get_u8();
        let id = match MessageId::try_from(raw_id) {
            Ok(id) => id,
            Err(id) => return Ok(Some(Message::Unknown { id, length: payload.len() })),
        };

        let msg = match id {
            MessageId::Choke => Message::read_zero(id, &payload, Message::Choke)?,
            MessageId::Unchoke => Message::read_zero(id, &payload, Message::Unchoke)?,
            MessageId::Interested => Message::read_zero(id, &payload, Message::Interested)?,
            MessageId::NotInterested => Message::read_zero(id, &payload, Message::NotInterested)?,
            MessageId::Have => {
                Message::expect_len(id, &payload, 4)?;
                Message::Have { index: payload.get_u32() }
            },
            MessageId::Bitfield => Message::Bitfield { bitmap: payload.to_vec() },
            MessageId::Request | MessageId::Cancel => {
                Message::expect_len(id, &payload, 12)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                if id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            },
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(MessageError::BadPayloadLength { id, expected: 8, received: payload.len() });
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece { index, begin, block: payload.to_vec() }
            },
        };
        Ok(Some(msg))
    }

    fn expect_len(id: MessageId, payload: &[u8], expected: usize) -> Result<(), MessageError> {
        if payload.len() != expected {
            return Err(MessageError::BadPayloadLength { id, expected, received: payload.len() });
        }
        Ok(())
    }

    fn read_zero(id: MessageId, payload: &[u8], msg: Message) -> Result<Message, MessageError> {
        Message::expect_len(id, payload, 0)?;
        Ok(msg)
    }

    /// Appends the length-prefixed wire form of this message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                Message::encode_header(self.id_byte(), 0, buf);
            },
            Message::Have { index } => {
                Message::encode_header(self.id_byte(), 4, buf);
                buf.put_u32(*index);
            },
            Message::Bitfield { bitmap } => {
                Message::encode_header(self.id_byte(), bitmap.len(), buf);
                buf.put_slice(bitmap);
            },
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                Message::encode_header(self.id_byte(), 12, buf);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            },
            Message::Piece { index, begin, block } => {
                Message::encode_header(self.id_byte(), 8 + block.len(), buf);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            },
            Message::Unknown { id, length } => {
                Message::encode_header(*id, *length, buf);
                buf.put_bytes(0, *length);
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    fn id_byte(&self) -> u8 {
        match self {
            Message::Unknown { id, .. } => *id,
            _ => self.id().map_or(0, |id| id as u8),
        }
    }

    fn encode_header(id: u8, payload_length: usize, buf: &mut BytesMut) {
        buf.reserve(LENGTH_PREFIX + 1 + payload_length);
        buf.put_u32(1 + payload_length as u32);
        buf.put_u8(id);
    }
}
