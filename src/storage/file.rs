use super::{FsWriter, PieceStore, StoredPart};
use crate::error::{BittorrentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Persisted record of which pieces of one download are on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PieceIndex {
    file_name: String,
    #[serde(default)]
    parts: Vec<PartRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PartRecord {
    index: u32,
    offset: u64,
    size: u64,
}

impl PieceIndex {
    fn find(&self, index: u32) -> Option<&PartRecord> {
        self.parts.iter().find(|p| p.index == index)
    }

    fn upsert(&mut self, record: PartRecord) {
        self.parts.retain(|p| p.index != record.index);
        self.parts.push(record);
        self.parts.sort_by_key(|p| p.index);
    }
}

/// Piece store backed by the target file itself plus a TOML index per download.
///
/// Piece bytes go to `<writer root>/<file name>` at their offset; the index
/// under `state_dir` is only updated after the bytes have landed.
pub struct FilePieceStore {
    state_dir: PathBuf,
    writer: FsWriter,
    indexes: Mutex<HashMap<String, PieceIndex>>,
}

impl FilePieceStore {
    pub async fn open<P: AsRef<Path>>(state_dir: P, writer: FsWriter) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&state_dir).await?;
        fs::create_dir_all(writer.root()).await?;

        info!(
            "Piece store initialized: data in {}, state in {}",
            writer.root().display(),
            state_dir.display()
        );

        Ok(Self {
            state_dir,
            writer,
            indexes: Mutex::new(HashMap::new()),
        })
    }

    /// Associate a download id with the file its pieces are written into.
    pub async fn bind(&self, id: &str, file_name: &str) -> Result<()> {
        let mut indexes = self.indexes.lock().await;
        let index = self.load_index(&mut indexes, id).await?;
        if index.file_name != file_name {
            index.file_name = file_name.to_string();
            let snapshot = index.clone();
            self.flush(id, &snapshot).await?;
        }
        Ok(())
    }

    fn index_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.pieces.toml", id))
    }

    async fn load_index<'a>(
        &self,
        indexes: &'a mut HashMap<String, PieceIndex>,
        id: &str,
    ) -> Result<&'a mut PieceIndex> {
        if !indexes.contains_key(id) {
            let path = self.index_path(id);
            let index = match fs::read_to_string(&path).await {
                Ok(raw) => toml::from_str(&raw).map_err(|e| {
                    BittorrentError::Storage(format!("corrupt index {}: {}", path.display(), e))
                })?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => PieceIndex {
                    file_name: id.to_string(),
                    parts: Vec::new(),
                },
                Err(e) => return Err(e.into()),
            };
            indexes.insert(id.to_string(), index);
        }
        indexes
            .get_mut(id)
            .ok_or_else(|| BittorrentError::Storage(format!("index for {} vanished", id)))
    }

    async fn flush(&self, id: &str, index: &PieceIndex) -> Result<()> {
        let raw = toml::to_string(index).map_err(|e| BittorrentError::Storage(e.to_string()))?;
        let path = self.index_path(id);
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_range(&self, file_name: &str, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.writer.root().join(file_name)).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; size as usize];
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }
}

impl PieceStore for FilePieceStore {
    async fn prepare(&self, id: &str, file_name: &str) -> Result<()> {
        self.bind(id, file_name).await
    }

    async fn loaded_indexes(&self, id: &str) -> Result<Vec<u32>> {
        let mut indexes = self.indexes.lock().await;
        let index = self.load_index(&mut indexes, id).await?;
        Ok(index.parts.iter().map(|p| p.index).collect())
    }

    async fn part_data(&self, id: &str, index: u32) -> Result<Option<StoredPart>> {
        let (file_name, record) = {
            let mut indexes = self.indexes.lock().await;
            let piece_index = self.load_index(&mut indexes, id).await?;
            match piece_index.find(index) {
                Some(record) => (piece_index.file_name.clone(), *record),
                None => return Ok(None),
            }
        };

        match self.read_range(&file_name, record.offset, record.size).await {
            Ok(data) => Ok(Some(StoredPart {
                data,
                offset: record.offset,
                size: record.size,
            })),
            Err(e) => {
                warn!("Piece {} of {} listed but unreadable: {}", index, id, e);
                Ok(None)
            }
        }
    }

    async fn drop_part(&self, id: &str, index: u32) -> Result<()> {
        let mut indexes = self.indexes.lock().await;
        let piece_index = self.load_index(&mut indexes, id).await?;
        piece_index.parts.retain(|p| p.index != index);
        let snapshot = piece_index.clone();
        self.flush(id, &snapshot).await?;
        debug!("Dropped piece {} of {}", index, id);
        Ok(())
    }

    async fn save_part(
        &self,
        id: &str,
        data: &[u8],
        offset: u64,
        size: u64,
        index: u32,
    ) -> Result<()> {
        let file_name = {
            let mut indexes = self.indexes.lock().await;
            self.load_index(&mut indexes, id).await?.file_name.clone()
        };

        self.writer.write(&file_name, data.to_vec(), offset).await?;

        let mut indexes = self.indexes.lock().await;
        let piece_index = self.load_index(&mut indexes, id).await?;
        piece_index.upsert(PartRecord {
            index,
            offset,
            size,
        });
        let snapshot = piece_index.clone();
        self.flush(id, &snapshot).await?;
        debug!("Saved piece {} of {} at offset {}", index, id, offset);
        Ok(())
    }
}
