use crate::config::PipelineLimits;
use crate::error::{BittorrentError, Result};
use crate::loads::LoadEntry;
use crate::peer::{Message, PeerConnection};
use crate::piece::{dump_failed_piece, verify_piece, PieceProgress, PieceResult, PieceWork, SchedulerHandle};
use crate::storage::FsWriter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a worker shares with the rest of its download.
#[derive(Clone)]
pub struct WorkerContext {
    pub scheduler: SchedulerHandle,
    pub entry: Arc<LoadEntry>,
    pub results: mpsc::Sender<PieceResult>,
    pub diagnostics: Option<FsWriter>,
    pub limits: PipelineLimits,
    pub cancel: CancellationToken,
}

/// Pulls pieces from the scheduler and fetches them over one peer connection.
pub struct DownloadWorker {
    conn: PeerConnection,
    ctx: WorkerContext,
}

impl DownloadWorker {
    pub fn new(conn: PeerConnection, ctx: WorkerContext) -> Self {
        Self { conn, ctx }
    }

    /// Work until the download ends (`Ok`) or this peer becomes unusable.
    ///
    /// The connection is closed when the worker returns.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(BittorrentError::Cancelled),
                next = self.ctx.scheduler.next_piece(self.conn.bitfield().clone()) => next,
            };
            let Some(mut work) = next else {
                debug!("Scheduler closed, releasing {}", self.conn.short_info());
                self.release().await;
                return Ok(());
            };

            if !self.conn.has_piece(work.index) {
                error!(
                    "Returning piece idx={} because {} doesn't have it",
                    work.index,
                    self.conn.short_info()
                );
                self.ctx.scheduler.recycle(work).await;
                continue;
            }

            if let Err(e) = self.ctx.entry.add_processed(work.index).await {
                error!(
                    "Failed to add piece idx={} ({} bytes carried) to processed: {}",
                    work.index,
                    work.carried_bytes(),
                    e
                );
                continue;
            }

            let carried = work.progress.as_ref().map(|p| p.buf.clone());
            let state = match self.attempt_download_piece(&mut work).await {
                Ok(state) => state,
                Err((state, err)) => {
                    if let Err(e) = self.ctx.entry.delete_processed(work.index).await {
                        error!("Failed to delete piece idx={} from processed: {}", work.index, e);
                    }
                    warn!(
                        "Recycling piece idx={} with {}/{} bytes after: {}",
                        work.index, state.downloaded, work.length, err
                    );
                    work.progress = Some(state);
                    self.ctx.scheduler.recycle(work).await;
                    return Err(err);
                }
            };

            if verify_piece(&work, &state.buf).is_err() {
                if let Some(writer) = &self.ctx.diagnostics {
                    dump_failed_piece(writer, work.index, &state.buf, carried.as_deref()).await;
                }
                if let Err(e) = self.ctx.entry.delete_processed(work.index).await {
                    error!("Failed to delete piece idx={} from processed: {}", work.index, e);
                }
                work.progress = None;
                self.ctx.scheduler.recycle(work).await;
                continue;
            }

            if let Err(e) = self.ctx.entry.set_done(work.index).await {
                error!("Failed to set piece idx={} as done: {}", work.index, e);
            }
            let have = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(BittorrentError::Cancelled),
                have = self.conn.send_have(work.index) => have,
            };
            if let Err(e) = have {
                debug!("Ignoring failed have for idx={}: {}", work.index, e);
            }

            let result = PieceResult {
                index: work.index,
                buf: state.buf,
            };
            if self.ctx.results.send(result).await.is_err() {
                debug!("Results closed, download is over");
                self.release().await;
                return Ok(());
            }
        }
    }

    /// Tell the peer we are done with it. Best effort.
    async fn release(&mut self) {
        if let Err(e) = self.conn.send_not_interested().await {
            debug!("Failed to send not interested to {}: {}", self.conn.peer().addr, e);
        }
    }

    /// Fetch every missing block of `work`, resuming carried progress.
    ///
    /// On failure the partial state comes back with the error so the piece
    /// can be handed to another peer.
    async fn attempt_download_piece(
        &mut self,
        work: &mut PieceWork,
    ) -> std::result::Result<PieceProgress, (PieceProgress, BittorrentError)> {
        let mut state = match work.progress.take() {
            Some(progress) if progress.index == work.index && progress.length() == work.length => {
                debug!(
                    "Resuming piece idx={}, downloaded={}/{}",
                    work.index, progress.downloaded, work.length
                );
                progress.resume()
            }
            Some(progress) => {
                error!(
                    "Carried progress for idx={} (len {}) does not fit piece idx={} (len {})",
                    progress.index,
                    progress.length(),
                    work.index,
                    work.length
                );
                PieceProgress::new(work.index, work.length, self.ctx.limits.max_block_size)
            }
            None => PieceProgress::new(work.index, work.length, self.ctx.limits.max_block_size),
        };

        debug!(
            "Attempting to download piece (len={}, idx={}) from {}",
            work.length,
            work.index,
            self.conn.short_info()
        );
        let read_timeout = self.conn.timeouts().read;

        while !state.is_complete() {
            if self.conn.is_choked() {
                return Err((state, BittorrentError::Choked { index: work.index }));
            }

            while state.backlog < self.ctx.limits.max_backlog {
                let Some((begin, length)) = state.next_request() else {
                    break;
                };
                let sent = tokio::select! {
                    biased;
                    _ = self.ctx.cancel.cancelled() => Err(BittorrentError::Cancelled),
                    sent = self.conn.send_request(work.index, begin, length) => sent,
                };
                if let Err(e) = sent {
                    return Err((state, e));
                }
            }

            let message = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => Err(BittorrentError::Cancelled),
                message = self.conn.read(read_timeout) => message,
            };

            match message {
                Ok(Some(block @ Message::Piece { .. })) => {
                    if let Err(e) = state.record_block(&block) {
                        debug!("Ignoring bad block for idx={}: {}", work.index, e);
                    }
                }
                Ok(_) => {}
                Err(e) => return Err((state, e)),
            }
        }

        info!(
            "Done loading piece idx={} of {} from {}",
            work.index,
            self.ctx.entry.id(),
            self.conn.peer().addr
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::test_support::{connect_to, Seeder, SeederBehavior};
    use crate::loads::LoadRegistry;
    use crate::peer::Bitfield;
    use crate::piece::{PieceWork, Scheduler};
    use sha1::{Digest, Sha1};
    use std::time::Duration;

    fn any_piece() -> Bitfield {
        Bitfield::from_peer(vec![0xff], 8).unwrap()
    }

    fn work_for(index: u32, data: &[u8]) -> PieceWork {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        PieceWork::new(index, hash, data.len())
    }

    struct Harness {
        ctx: WorkerContext,
        results: mpsc::Receiver<PieceResult>,
        cancel: CancellationToken,
    }

    async fn harness(pieces: Vec<PieceWork>, diagnostics: Option<FsWriter>) -> Harness {
        let registry = LoadRegistry::new();
        let cancel = CancellationToken::new();
        let entry = registry
            .add_load_entry("w", cancel.clone(), pieces.len())
            .await
            .unwrap();
        let (_tx, priorities) = mpsc::unbounded_channel();
        let (scheduler, _task) = Scheduler::spawn(pieces, 0, priorities, cancel.clone());
        let (results_tx, results) = mpsc::channel(16);

        Harness {
            ctx: WorkerContext {
                scheduler,
                entry,
                results: results_tx,
                diagnostics,
                limits: PipelineLimits {
                    max_backlog: 2,
                    max_block_size: 16,
                },
                cancel: cancel.clone(),
            },
            results,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_downloads_and_verifies_pieces() {
        let content: Vec<u8> = (0..100u8).collect();
        let seeder = Seeder::start(content.clone(), 40, SeederBehavior::Honest).await;
        let pieces = vec![work_for(0, &content[..40]), work_for(1, &content[40..80])];
        let mut h = harness(pieces, None).await;

        let conn = connect_to(&seeder).await;
        let worker = tokio::spawn(DownloadWorker::new(conn, h.ctx.clone()).run());

        let mut got = vec![h.results.recv().await.unwrap(), h.results.recv().await.unwrap()];
        got.sort_by_key(|r| r.index);
        assert_eq!(got[0].buf, content[..40].to_vec());
        assert_eq!(got[1].buf, content[40..80].to_vec());
        assert_eq!(h.ctx.entry.stats().await.done_pieces, vec![0, 1]);

        h.cancel.cancel();
        assert!(matches!(worker.await.unwrap(), Err(BittorrentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_only_fetches_pieces_the_peer_has() {
        let content: Vec<u8> = (0..100u8).collect();
        let seeder = Seeder::with_pieces(content.clone(), 40, &[2], SeederBehavior::Honest).await;
        let pieces = vec![
            work_for(0, &content[..40]),
            work_for(1, &content[40..80]),
            work_for(2, &content[80..]),
        ];
        let mut h = harness(pieces, None).await;

        let conn = connect_to(&seeder).await;
        assert!(!conn.bitfield().has(0));
        let worker = tokio::spawn(DownloadWorker::new(conn, h.ctx.clone()).run());

        // target 0 is nearest, but this peer can only serve piece 2
        assert_eq!(h.results.recv().await.unwrap().index, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.ctx.entry.stats().await.in_progress_pieces.is_empty());
        assert_eq!(h.ctx.entry.stats().await.done_pieces, vec![2]);
        assert_eq!(seeder.requested_pieces().await, vec![2]);

        h.cancel.cancel();
        assert!(matches!(worker.await.unwrap(), Err(BittorrentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_sends_not_interested_when_download_is_over() {
        let content: Vec<u8> = (0..40u8).collect();
        let seeder = Seeder::start(content.clone(), 40, SeederBehavior::Honest).await;
        let Harness { ctx, results, cancel } = harness(vec![work_for(0, &content)], None).await;
        drop(results);

        let conn = connect_to(&seeder).await;
        DownloadWorker::new(conn, ctx.clone()).run().await.unwrap();

        for _ in 0..100 {
            if seeder.was_released() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seeder.was_released());
        assert_eq!(ctx.entry.stats().await.done_pieces, vec![0]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dropped_connection_recycles_partial_piece() {
        let content: Vec<u8> = (0..80u8).collect();
        // 5 blocks of 16, the seeder hangs up after serving 2 of them
        let seeder = Seeder::start(content.clone(), 80, SeederBehavior::HangUpAfter(2)).await;
        let mut h = harness(vec![work_for(0, &content)], None).await;

        let conn = connect_to(&seeder).await;
        let result = DownloadWorker::new(conn, h.ctx.clone()).run().await;
        assert!(result.unwrap_err().is_transport());
        assert!(h.ctx.entry.stats().await.in_progress_pieces.is_empty());

        let returned = h.ctx.scheduler.next_piece(any_piece()).await.unwrap();
        assert_eq!(returned.index, 0);
        assert_eq!(returned.carried_bytes(), 32);

        // a second peer finishes it starting from the carried blocks
        let honest = Seeder::start(content.clone(), 80, SeederBehavior::Honest).await;
        h.ctx.scheduler.recycle(returned).await;
        let conn = connect_to(&honest).await;
        let worker = tokio::spawn(DownloadWorker::new(conn, h.ctx.clone()).run());

        let result = h.results.recv().await.unwrap();
        assert_eq!(result.buf, content);
        assert_eq!(honest.requested_offsets().await, vec![32, 48, 64]);

        h.cancel.cancel();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_choke_mid_piece_recycles_with_progress() {
        let content: Vec<u8> = (0..80u8).collect();
        let seeder = Seeder::start(content.clone(), 80, SeederBehavior::ChokeAfter(1)).await;
        let h = harness(vec![work_for(0, &content)], None).await;

        let conn = connect_to(&seeder).await;
        let result = DownloadWorker::new(conn, h.ctx.clone()).run().await;
        assert!(matches!(result, Err(BittorrentError::Choked { index: 0 })));

        let returned = h.ctx.scheduler.next_piece(any_piece()).await.unwrap();
        assert!(returned.carried_bytes() >= 16);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_dumped_and_retried_from_zero() {
        let content: Vec<u8> = (0..40u8).collect();
        let seeder = Seeder::start(content.clone(), 40, SeederBehavior::Corrupt).await;
        let root = crate::storage::test_dir("worker-dumps");
        let (writer, _writer_task) = FsWriter::spawn(&root, 8);
        let h = harness(vec![work_for(0, &content)], Some(writer)).await;

        let conn = connect_to(&seeder).await;
        let worker = tokio::spawn(DownloadWorker::new(conn, h.ctx.clone()).run());

        // the corrupt seeder keeps failing; wait for the first dump
        let dump = root.join("piece_0_failed_buf");
        for _ in 0..100 {
            if tokio::fs::metadata(&dump).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tokio::fs::metadata(&dump).await.is_ok());
        assert!(h.ctx.entry.stats().await.done_pieces.is_empty());

        h.cancel.cancel();
        assert!(matches!(worker.await.unwrap(), Err(BittorrentError::Cancelled)));
    }
}
