mod entry;

pub use entry::LoadEntry;

use crate::error::{BittorrentError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Snapshot of one download for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub active_peers: usize,
    pub total_pieces: usize,
    pub done_pieces: Vec<u32>,
    pub in_progress_pieces: Vec<u32>,
    pub loaded_percent: u8,
}

/// Every running download, by id.
///
/// The registry lock only guards the map; per-piece bookkeeping lives behind
/// each [`LoadEntry`]'s own lock.
#[derive(Debug, Default)]
pub struct LoadRegistry {
    loads: Mutex<HashMap<String, Arc<LoadEntry>>>,
}

impl LoadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a download. Fails if `id` is already running.
    pub async fn add_load_entry(
        &self,
        id: &str,
        cancel: CancellationToken,
        total_pieces: usize,
    ) -> Result<Arc<LoadEntry>> {
        let mut loads = self.loads.lock().await;
        if loads.contains_key(id) {
            return Err(BittorrentError::LoadExists(id.to_string()));
        }

        let entry = Arc::new(LoadEntry::new(id, cancel, total_pieces));
        loads.insert(id.to_string(), Arc::clone(&entry));
        debug!("Added load entry for {}", id);
        Ok(entry)
    }

    /// Cancel a download and forget it. Returns `false` if it was not running.
    pub async fn stop_load(&self, id: &str) -> bool {
        let entry = self.loads.lock().await.remove(id);
        match entry {
            Some(entry) => {
                entry.cancel_token().cancel();
                info!("Stopped load {}", id);
                true
            }
            None => false,
        }
    }

    pub async fn entry(&self, id: &str) -> Option<Arc<LoadEntry>> {
        self.loads.lock().await.get(id).cloned()
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.loads.lock().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loads.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get_stats_for_entry(&self, id: &str) -> Result<LoadStats> {
        // look up under the registry lock, read under the entry lock
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| BittorrentError::LoadNotFound(id.to_string()))?;
        Ok(entry.stats().await)
    }

    /// Stop every download still registered.
    pub async fn close(&self) {
        let entries: Vec<(String, Arc<LoadEntry>)> = self.loads.lock().await.drain().collect();
        for (id, entry) in entries {
            entry.cancel_token().cancel();
            info!("Stopped load {} on shutdown", id);
        }
    }
}
