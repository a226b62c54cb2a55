mod file;
mod memory;
mod writer;

pub use file::FilePieceStore;
pub use memory::MemoryPieceStore;
pub use writer::FsWriter;

use crate::error::Result;
use std::future::Future;

/// Bytes of one persisted piece and where they sit in the target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPart {
    pub data: Vec<u8>,
    pub offset: u64,
    pub size: u64,
}

/// Completed pieces of every download, keyed by `(download id, piece index)`.
///
/// Saving the same piece twice is a plain overwrite.
pub trait PieceStore: Send + Sync + 'static {
    /// Called once before a download starts writing pieces of `file_name`.
    fn prepare(&self, id: &str, file_name: &str) -> impl Future<Output = Result<()>> + Send {
        let _ = (id, file_name);
        async { Ok(()) }
    }

    fn loaded_indexes(&self, id: &str) -> impl Future<Output = Result<Vec<u32>>> + Send;

    fn part_data(
        &self,
        id: &str,
        index: u32,
    ) -> impl Future<Output = Result<Option<StoredPart>>> + Send;

    fn drop_part(&self, id: &str, index: u32) -> impl Future<Output = Result<()>> + Send;

    fn save_part(
        &self,
        id: &str,
        data: &[u8],
        offset: u64,
        size: u64,
        index: u32,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
pub(crate) fn test_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "streamtorrent-{}-{}",
        tag,
        hex::encode(rand::random::<[u8; 6]>())
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
