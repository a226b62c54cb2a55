use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame accepted from a peer: a 1 MiB block plus the piece header.
pub const MAX_FRAME_LEN: usize = (1 << 20) + 13;

/// Information about a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Piece index
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.piece_index);
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
    }

    fn take(payload: &mut &[u8], what: &str) -> Result<Self> {
        if payload.len() < 12 {
            return Err(BittorrentError::MalformedMessage(format!(
                "{} payload is {} bytes, need 12",
                what,
                payload.len()
            )));
        }
        Ok(Self::new(
            payload.get_u32(),
            payload.get_u32(),
            payload.get_u32(),
        ))
    }
}

/// Messages exchanged between peers.
///
/// Keep-alives are not a variant: they decode to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { block: BlockInfo },
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel { block: BlockInfo },
    /// Anything outside the core protocol (extensions, DHT port, ...).
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;

    pub fn id(&self) -> u8 {
        match self {
            Message::Choke => Self::CHOKE,
            Message::Unchoke => Self::UNCHOKE,
            Message::Interested => Self::INTERESTED,
            Message::NotInterested => Self::NOT_INTERESTED,
            Message::Have { .. } => Self::HAVE,
            Message::Bitfield { .. } => Self::BITFIELD,
            Message::Request { .. } => Self::REQUEST,
            Message::Piece { .. } => Self::PIECE,
            Message::Cancel { .. } => Self::CANCEL,
            Message::Unknown { id, .. } => *id,
        }
    }

    /// The 4-byte zero-length frame.
    #[cfg(test)]
    pub fn keep_alive() -> [u8; 4] {
        [0; 4]
    }

    /// Serialize message to a frame
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = BytesMut::new();

        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } => payload.put_u32(*piece_index),
            Message::Bitfield { bitfield } => payload.put_slice(bitfield),
            Message::Request { block } | Message::Cancel { block } => block.put(&mut payload),
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                payload.put_u32(*piece_index);
                payload.put_u32(*offset);
                payload.put_slice(data);
            }
            Message::Unknown { payload: raw, .. } => payload.put_slice(raw),
        }

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u32(1 + payload.len() as u32);
        frame.put_u8(self.id());
        frame.put_slice(&payload);
        frame.to_vec()
    }

    /// Deserialize a complete frame, length prefix included.
    #[cfg(test)]
    pub fn from_bytes(mut frame: &[u8]) -> Result<Option<Self>> {
        if frame.len() < 4 {
            return Err(BittorrentError::MalformedMessage(
                "frame shorter than its length prefix".to_string(),
            ));
        }

        let length = frame.get_u32() as usize;
        if length == 0 {
            return Ok(None);
        }
        if frame.len() < length {
            return Err(BittorrentError::MalformedMessage(format!(
                "frame announces {} bytes, got {}",
                length,
                frame.len()
            )));
        }

        let id = frame.get_u8();
        Self::from_payload(id, &frame[..length - 1]).map(Some)
    }

    fn from_payload(id: u8, mut payload: &[u8]) -> Result<Self> {
        let message = match id {
            Self::CHOKE => Message::Choke,
            Self::UNCHOKE => Message::Unchoke,
            Self::INTERESTED => Message::Interested,
            Self::NOT_INTERESTED => Message::NotInterested,
            Self::HAVE => {
                if payload.len() < 4 {
                    return Err(BittorrentError::MalformedMessage(format!(
                        "have payload is {} bytes, need 4",
                        payload.len()
                    )));
                }
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            Self::BITFIELD => Message::Bitfield {
                bitfield: payload.to_vec(),
            },
            Self::REQUEST => Message::Request {
                block: BlockInfo::take(&mut payload, "request")?,
            },
            Self::PIECE => {
                if payload.len() < 8 {
                    return Err(BittorrentError::MalformedMessage(format!(
                        "piece payload is {} bytes, need at least 8",
                        payload.len()
                    )));
                }
                Message::Piece {
                    piece_index: payload.get_u32(),
                    offset: payload.get_u32(),
                    data: payload.to_vec(),
                }
            }
            Self::CANCEL => Message::Cancel {
                block: BlockInfo::take(&mut payload, "cancel")?,
            },
            _ => Message::Unknown {
                id,
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }
}

/// Read one length-prefixed frame. `None` means keep-alive.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf) as usize;

    if length == 0 {
        return Ok(None);
    }
    if length > MAX_FRAME_LEN {
        return Err(BittorrentError::MalformedMessage(format!(
            "frame of {} bytes exceeds limit",
            length
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    Message::from_payload(body[0], &body[1..]).map(Some)
}

/// Extract the piece index announced by a `Have`.
pub fn parse_have(message: &Message) -> Result<u32> {
    match message {
        Message::Have { piece_index } => Ok(*piece_index),
        other => Err(BittorrentError::Protocol(format!(
            "expected have (ID {}), got ID {}",
            Message::HAVE,
            other.id()
        ))),
    }
}

/// Copy a received block into `buf` and return the number of bytes written.
pub fn parse_piece(expected_index: u32, buf: &mut [u8], message: &Message) -> Result<usize> {
    let (piece_index, offset, data) = match message {
        Message::Piece {
            piece_index,
            offset,
            data,
        } => (*piece_index, *offset as usize, data),
        other => {
            return Err(BittorrentError::Protocol(format!(
                "expected piece (ID {}), got ID {}",
                Message::PIECE,
                other.id()
            )))
        }
    };

    if piece_index != expected_index {
        return Err(BittorrentError::MalformedMessage(format!(
            "expected piece {}, got {}",
            expected_index, piece_index
        )));
    }
    if offset >= buf.len() {
        return Err(BittorrentError::MalformedMessage(format!(
            "begin offset {} out of bounds for piece of {} bytes",
            offset,
            buf.len()
        )));
    }
    if offset + data.len() > buf.len() {
        return Err(BittorrentError::MalformedMessage(format!(
            "block of {} bytes at {} overflows piece of {} bytes",
            data.len(),
            offset,
            buf.len()
        )));
    }

    buf[offset..offset + data.len()].copy_from_slice(data);
    Ok(data.len())
}
