mod integrity;
mod progress;
mod scheduler;

pub use integrity::{dump_failed_piece, verify_piece};
pub use progress::PieceProgress;
pub use scheduler::{Scheduler, SchedulerHandle};

/// Standard block size (16 KB)
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024;

/// Outstanding block requests per peer.
pub const MAX_BACKLOG: usize = 5;

/// One piece still to be fetched.
///
/// Only one worker holds a given `PieceWork` at a time; it moves through the
/// scheduler's channels and carries the partial buffer of an interrupted
/// attempt in `progress`.
#[derive(Debug)]
pub struct PieceWork {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: usize,
    pub progress: Option<PieceProgress>,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: usize) -> Self {
        Self {
            index,
            hash,
            length,
            progress: None,
        }
    }

    /// Bytes already fetched by an earlier attempt.
    pub fn carried_bytes(&self) -> usize {
        self.progress.as_ref().map_or(0, |p| p.downloaded)
    }
}

/// A verified piece, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: u32,
    pub buf: Vec<u8>,
}

/// A piece placed in the target file, as announced to readers of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPiece {
    pub index: u32,
    pub data: Vec<u8>,
    pub offset: u64,
    pub len: u64,
}

/// Map a byte position in the file to the piece holding it.
pub fn piece_for_byte(byte_offset: u64, piece_length: u64) -> i64 {
    if piece_length == 0 {
        return 0;
    }
    (byte_offset / piece_length) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_for_byte() {
        assert_eq!(piece_for_byte(0, 16384), 0);
        assert_eq!(piece_for_byte(16383, 16384), 0);
        assert_eq!(piece_for_byte(16384, 16384), 1);
        assert_eq!(piece_for_byte(5, 0), 0);
    }
}
