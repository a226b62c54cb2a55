use super::LoadStats;
use crate::error::{BittorrentError, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct EntryState {
    /// Present = handed to a worker or finished; `true` = finished.
    processed: HashMap<u32, bool>,
    active_peers: usize,
}

/// Live bookkeeping for one running download.
///
/// Every mutation goes through this entry's own lock, so updates to one
/// download never wait on another.
#[derive(Debug)]
pub struct LoadEntry {
    id: String,
    cancel: CancellationToken,
    total_pieces: usize,
    state: Mutex<EntryState>,
}

impl LoadEntry {
    pub(super) fn new(id: &str, cancel: CancellationToken, total_pieces: usize) -> Self {
        Self {
            id: id.to_string(),
            cancel,
            total_pieces,
            state: Mutex::new(EntryState {
                processed: HashMap::with_capacity(total_pieces),
                active_peers: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The token that stops this download.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark a piece as handed to a worker.
    pub async fn add_processed(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(done) = state.processed.get(&index) {
            return Err(BittorrentError::Invariant(format!(
                "tried to add idx={} to process, but it is already there (done={})",
                index, done
            )));
        }
        state.processed.insert(index, false);
        Ok(())
    }

    /// Forget an in-flight piece so it can be assigned again.
    pub async fn delete_processed(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.processed.get(&index) {
            None => Err(BittorrentError::Invariant(format!(
                "tried to delete idx={} from process, but it is not there",
                index
            ))),
            Some(true) => Err(BittorrentError::Invariant(format!(
                "tried to delete idx={} from process, but it is already done",
                index
            ))),
            Some(false) => {
                state.processed.remove(&index);
                debug!("Deleted processed piece idx={}", index);
                Ok(())
            }
        }
    }

    /// Move an in-flight piece to done.
    pub async fn set_done(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.processed.get_mut(&index) {
            None => Err(BittorrentError::Invariant(format!(
                "tried to set idx={} as done, but it is not processed yet",
                index
            ))),
            Some(true) => Err(BittorrentError::Invariant(format!(
                "tried to set idx={} as done, but it is already set as done",
                index
            ))),
            Some(done) => {
                *done = true;
                Ok(())
            }
        }
    }

    /// Mark a piece done without the in-flight step, for pieces restored from disk.
    pub async fn force_set_done(&self, index: u32) {
        self.state.lock().await.processed.insert(index, true);
    }

    pub async fn count_done(&self) -> usize {
        self.state.lock().await.processed.values().filter(|d| **d).count()
    }

    /// Whole percent of pieces done, rounded down; 100 only once all are done.
    pub async fn loaded_percent(&self) -> u8 {
        percent(self.count_done().await, self.total_pieces)
    }

    /// Everything a status query reports, read under one lock.
    pub async fn stats(&self) -> LoadStats {
        let state = self.state.lock().await;
        let mut done_pieces = Vec::new();
        let mut in_progress_pieces = Vec::new();
        for (&index, &finished) in &state.processed {
            if finished {
                done_pieces.push(index);
            } else {
                in_progress_pieces.push(index);
            }
        }
        done_pieces.sort_unstable();
        in_progress_pieces.sort_unstable();

        LoadStats {
            active_peers: state.active_peers,
            total_pieces: self.total_pieces,
            loaded_percent: percent(done_pieces.len(), self.total_pieces),
            done_pieces,
            in_progress_pieces,
        }
    }

    pub async fn incr_active_peers(&self) {
        self.state.lock().await.active_peers += 1;
    }

    pub async fn decr_active_peers(&self) {
        let mut state = self.state.lock().await;
        state.active_peers = state.active_peers.saturating_sub(1);
    }

}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}
