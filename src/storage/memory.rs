use super::{PieceStore, StoredPart};
use crate::error::Result;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

/// Piece store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryPieceStore {
    parts: Mutex<HashMap<String, BTreeMap<u32, StoredPart>>>,
}

impl MemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    /// Reassemble the bytes saved so far for `id`, in offset order.
    pub async fn assembled(&self, id: &str) -> Vec<u8> {
        let parts = self.parts.lock().await;
        let mut out = Vec::new();
        if let Some(pieces) = parts.get(id) {
            let mut sorted: Vec<&StoredPart> = pieces.values().collect();
            sorted.sort_by_key(|p| p.offset);
            for part in sorted {
                let end = (part.offset + part.size) as usize;
                if out.len() < end {
                    out.resize(end, 0);
                }
                out[part.offset as usize..end].copy_from_slice(&part.data);
            }
        }
        out
    }

    #[cfg(test)]
    /// Overwrite a stored part without any checks, to simulate disk corruption.
    pub async fn corrupt(&self, id: &str, index: u32) {
        if let Some(part) = self
            .parts
            .lock()
            .await
            .get_mut(id)
            .and_then(|pieces| pieces.get_mut(&index))
        {
            for byte in part.data.iter_mut() {
                *byte = !*byte;
            }
        }
    }
}

impl PieceStore for MemoryPieceStore {
    async fn loaded_indexes(&self, id: &str) -> Result<Vec<u32>> {
        let parts = self.parts.lock().await;
        Ok(parts
            .get(id)
            .map(|pieces| pieces.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn part_data(&self, id: &str, index: u32) -> Result<Option<StoredPart>> {
        let parts = self.parts.lock().await;
        Ok(parts.get(id).and_then(|pieces| pieces.get(&index)).cloned())
    }

    async fn drop_part(&self, id: &str, index: u32) -> Result<()> {
        if let Some(pieces) = self.parts.lock().await.get_mut(id) {
            pieces.remove(&index);
        }
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
        self.parts.lock().await.entry(id.to_string()).or_default().insert(
            index,
            StoredPart {
                data: data.to_vec(),
                offset,
                size,
            },
        );
        Ok(())
    }
}
