use crate::error::{BittorrentError, Result};
use crate::peer::{parse_piece, Message};

/// State of one download attempt for one piece.
///
/// Blocks are fixed-size slots of `block_size` bytes (the last one may be
/// shorter). `received` remembers which slots already landed in `buf`, so an
/// interrupted attempt can be resumed without fetching them again.
#[derive(Debug, Clone)]
pub struct PieceProgress {
    pub index: u32,
    pub buf: Vec<u8>,
    pub downloaded: usize,
    pub requested: usize,
    pub backlog: usize,
    block_size: u32,
    received: Vec<bool>,
    next_block: usize,
}

impl PieceProgress {
    pub fn new(index: u32, length: usize, block_size: u32) -> Self {
        let blocks = length.div_ceil(block_size as usize);
        Self {
            index,
            buf: vec![0u8; length],
            downloaded: 0,
            requested: 0,
            backlog: 0,
            block_size,
            received: vec![false; blocks],
            next_block: 0,
        }
    }

    /// Prepare carried-over state for a new connection. Requests in flight on
    /// the old connection are gone, so only missing blocks are asked for again.
    pub fn resume(mut self) -> Self {
        self.backlog = 0;
        self.requested = self.downloaded;
        self.next_block = 0;
        self
    }

    pub fn length(&self) -> usize {
        self.buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.buf.len()
    }

    fn block_len(&self, slot: usize) -> usize {
        let begin = slot * self.block_size as usize;
        (self.buf.len() - begin).min(self.block_size as usize)
    }

    /// Next `(begin, length)` to request, or `None` once everything missing
    /// has been asked for.
    pub fn next_request(&mut self) -> Option<(u32, u32)> {
        if self.requested >= self.buf.len() {
            return None;
        }

        while self.next_block < self.received.len() && self.received[self.next_block] {
            self.next_block += 1;
        }
        if self.next_block >= self.received.len() {
            return None;
        }

        let slot = self.next_block;
        let length = self.block_len(slot);
        self.next_block += 1;
        self.requested += length;
        self.backlog += 1;

        Some(((slot * self.block_size as usize) as u32, length as u32))
    }

    /// Store a `Piece` message. Returns the number of new bytes.
    pub fn record_block(&mut self, message: &Message) -> Result<usize> {
        self.backlog = self.backlog.saturating_sub(1);

        let (offset, len) = match message {
            Message::Piece { offset, data, .. } => (*offset as usize, data.len()),
            other => {
                return Err(BittorrentError::Protocol(format!(
                    "expected piece, got ID {}",
                    other.id()
                )))
            }
        };

        let slot = offset / self.block_size as usize;
        if offset % self.block_size as usize != 0
            || slot >= self.received.len()
            || len != self.block_len(slot)
        {
            return Err(BittorrentError::MalformedMessage(format!(
                "block of {} bytes at {} does not match a requested slot of piece {}",
                len, offset, self.index
            )));
        }

        let written = parse_piece(self.index, &mut self.buf, message)?;
        if self.received[slot] {
            return Ok(0);
        }
        self.received[slot] = true;
        self.downloaded += written;
        Ok(written)
    }
}
