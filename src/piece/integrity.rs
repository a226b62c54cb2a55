use super::PieceWork;
use crate::error::{BittorrentError, Result};
use crate::storage::FsWriter;
use sha1::{Digest, Sha1};
use tracing::{error, warn};

/// Check an assembled piece against its expected SHA-1.
pub fn verify_piece(work: &PieceWork, buf: &[u8]) -> Result<()> {
    if buf.len() != work.length {
        error!(
            "Piece {} buffer holds {} bytes, expected {}",
            work.index,
            buf.len(),
            work.length
        );
        return Err(BittorrentError::Integrity { index: work.index });
    }

    let hash = Sha1::digest(buf);
    if hash.as_slice() != work.hash.as_slice() {
        error!(
            "Piece {} failed integrity check (loaded_hash={}, piece_hash={})",
            work.index,
            hex::encode(hash),
            hex::encode(work.hash)
        );
        return Err(BittorrentError::Integrity { index: work.index });
    }

    Ok(())
}

/// Keep the bytes of a piece that failed verification for later inspection.
pub async fn dump_failed_piece(writer: &FsWriter, index: u32, buf: &[u8], carried: Option<&[u8]>) {
    if let Err(e) = writer
        .dump(format!("piece_{}_failed_buf", index), buf.to_vec())
        .await
    {
        warn!("Failed to dump piece {} buffer: {}", index, e);
    }

    if let Some(carried) = carried {
        if let Err(e) = writer
            .dump(format!("piece_{}_failed_prog", index), carried.to_vec())
            .await
        {
            warn!("Failed to dump piece {} carried progress: {}", index, e);
        }
    }
}
