use super::worker::{DownloadWorker, WorkerContext};
use crate::config::PipelineLimits;
use crate::error::{BittorrentError, Result};
use crate::loads::LoadEntry;
use crate::peer::{Peer, PeerConnection};
use crate::piece::{verify_piece, LoadedPiece, PieceResult, PieceWork, Scheduler};
use crate::storage::{FsWriter, PieceStore};
use crate::torrent::TorrentInfo;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channels that connect one download to the world around it.
pub struct DownloadChannels {
    /// Activated (handshaken and unchoked) connections.
    pub peers: mpsc::Receiver<PeerConnection>,
    /// Peers whose worker failed, for re-dialing.
    pub dead_peers: mpsc::Sender<Peer>,
    /// New target piece indexes, applied in delivery order.
    pub priorities: mpsc::UnboundedReceiver<i64>,
    /// Receives every piece that is in place, restored ones first.
    pub loaded: Option<mpsc::Sender<LoadedPiece>>,
}

/// One download of one torrent, from restored state to the last piece.
pub struct Download<S: PieceStore> {
    pub id: String,
    pub info: TorrentInfo,
    pub store: Arc<S>,
    pub entry: Arc<LoadEntry>,
    pub diagnostics: Option<FsWriter>,
    pub limits: PipelineLimits,
    pub max_workers: usize,
    pub initial_target: i64,
}

impl<S: PieceStore> Download<S> {
    /// Run until every piece is persisted.
    ///
    /// Fails with [`BittorrentError::Cancelled`] when the load is stopped and
    /// with [`BittorrentError::NoPeers`] once the peer supply has dried up
    /// and every worker is gone.
    pub async fn run(self, channels: DownloadChannels) -> Result<()> {
        let DownloadChannels {
            peers,
            dead_peers,
            priorities,
            mut loaded,
        } = channels;

        let cancel = self.entry.cancel_token().child_token();
        let _stop_on_exit = cancel.clone().drop_guard();

        let pending = self.restore_completed(&mut loaded).await?;
        if pending.is_empty() {
            info!("Load {} already complete", self.id);
            return Ok(());
        }
        info!(
            "Load {}: {} of {} pieces left to download",
            self.id,
            pending.len(),
            self.info.num_pieces()
        );

        let remaining = pending.len();
        let (scheduler, scheduler_task) =
            Scheduler::spawn(pending, self.initial_target, priorities, cancel.clone());
        let (results_tx, mut results) = mpsc::channel(self.max_workers.max(1));

        let ctx = WorkerContext {
            scheduler,
            entry: Arc::clone(&self.entry),
            results: results_tx,
            diagnostics: self.diagnostics.clone(),
            limits: self.limits,
            cancel: cancel.clone(),
        };
        let intake = tokio::spawn(run_workers(peers, dead_peers, ctx, self.max_workers));

        let outcome = self
            .collect_results(&mut results, remaining, &cancel, &mut loaded)
            .await;

        cancel.cancel();
        drop(results);
        if let Err(e) = intake.await {
            error!("Worker intake for {} panicked: {}", self.id, e);
        }
        if let Err(e) = scheduler_task.await {
            error!("Scheduler for {} panicked: {}", self.id, e);
        }

        match &outcome {
            Ok(()) => info!("Load {} finished", self.id),
            Err(e) => warn!("Load {} ended: {}", self.id, e),
        }
        outcome
    }

    /// Re-verify pieces persisted by an earlier run and return the rest as work.
    async fn restore_completed(
        &self,
        loaded: &mut Option<mpsc::Sender<LoadedPiece>>,
    ) -> Result<Vec<PieceWork>> {
        let stored: HashSet<u32> = self.store.loaded_indexes(&self.id).await?.into_iter().collect();
        let mut pending = Vec::new();

        for (i, hash) in self.info.piece_hashes.iter().enumerate() {
            let index = i as u32;
            let work = PieceWork::new(index, *hash, self.info.piece_size(index));

            if stored.contains(&index) {
                match self.store.part_data(&self.id, index).await {
                    Ok(Some(part)) if verify_piece(&work, &part.data).is_ok() => {
                        self.entry.force_set_done(index).await;
                        let piece = LoadedPiece {
                            index,
                            data: part.data,
                            offset: part.offset,
                            len: part.size,
                        };
                        emit(loaded, piece).await;
                        continue;
                    }
                    Ok(_) => {
                        warn!("Dropping persisted piece idx={} of {}, it no longer verifies", index, self.id);
                        self.store.drop_part(&self.id, index).await?;
                    }
                    Err(e) => {
                        warn!("Cannot read persisted piece idx={} of {}: {}", index, self.id, e);
                        self.store.drop_part(&self.id, index).await?;
                    }
                }
            }
            pending.push(work);
        }

        let restored = self.info.num_pieces() - pending.len();
        if restored > 0 {
            info!("Restored {} verified pieces of {}", restored, self.id);
        }
        Ok(pending)
    }

    async fn collect_results(
        &self,
        results: &mut mpsc::Receiver<PieceResult>,
        mut remaining: usize,
        cancel: &CancellationToken,
        loaded: &mut Option<mpsc::Sender<LoadedPiece>>,
    ) -> Result<()> {
        while remaining > 0 {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BittorrentError::Cancelled),
                result = results.recv() => result,
            };
            let Some(result) = result else {
                return Err(BittorrentError::NoPeers(self.id.clone()));
            };

            let (begin, end) = self.info.piece_bounds(result.index);
            self.store
                .save_part(&self.id, &result.buf, begin, end - begin, result.index)
                .await
                .map_err(|e| {
                    BittorrentError::Storage(format!(
                        "failed to persist piece {} of {}: {}",
                        result.index, self.id, e
                    ))
                })?;
            remaining -= 1;

            emit(
                loaded,
                LoadedPiece {
                    index: result.index,
                    data: result.buf,
                    offset: begin,
                    len: end - begin,
                },
            )
            .await;

            info!(
                "Load {}: piece idx={} stored, {}% done, {} left",
                self.id,
                result.index,
                self.entry.loaded_percent().await,
                remaining
            );
        }
        Ok(())
    }
}

async fn emit(loaded: &mut Option<mpsc::Sender<LoadedPiece>>, piece: LoadedPiece) {
    if let Some(tx) = loaded {
        if tx.send(piece).await.is_err() {
            debug!("Loaded piece listener went away");
            *loaded = None;
        }
    }
}

/// Start a worker for every incoming connection, at most `max_workers` at once.
async fn run_workers(
    mut peers: mpsc::Receiver<PeerConnection>,
    dead_peers: mpsc::Sender<Peer>,
    ctx: WorkerContext,
    max_workers: usize,
) {
    let limiter = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut workers = JoinSet::new();

    loop {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            permit = Arc::clone(&limiter).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let conn = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            conn = peers.recv() => match conn {
                Some(conn) => conn,
                None => {
                    debug!("Peer supply closed");
                    break;
                }
            },
        };
        while workers.try_join_next().is_some() {}

        let ctx = ctx.clone();
        let dead_peers = dead_peers.clone();
        workers.spawn(async move {
            let _permit = permit;
            let mut peer = conn.peer().clone();

            ctx.entry.incr_active_peers().await;
            let result = DownloadWorker::new(conn, ctx.clone()).run().await;
            ctx.entry.decr_active_peers().await;

            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if e.is_transport() {
                        info!("Lost peer {}: {}", peer.addr, e);
                    } else {
                        warn!("Worker for {} stopped: {}", peer.addr, e);
                    }
                    peer.is_dead = true;
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {}
                        _ = dead_peers.send(peer) => {}
                    }
                }
            }
        });
    }

    // the results channel closes once the last worker lets go of its context
    drop(ctx);
    drop(dead_peers);
    while workers.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::test_support::{connect_to, Seeder, SeederBehavior};
    use crate::loads::LoadRegistry;
    use crate::storage::MemoryPieceStore;
    use crate::torrent::tests::torrent_bytes;
    use crate::torrent::Metainfo;
    use std::time::Duration;

    const PIECE_LEN: usize = 32;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn info_for(content: &[u8]) -> TorrentInfo {
        Metainfo::from_bytes(&torrent_bytes("clip.mp4", content, PIECE_LEN))
            .unwrap()
            .info
    }

    struct Setup {
        download: Download<MemoryPieceStore>,
        store: Arc<MemoryPieceStore>,
        entry: Arc<LoadEntry>,
        cancel: CancellationToken,
        peer_tx: mpsc::Sender<PeerConnection>,
        dead_rx: mpsc::Receiver<Peer>,
        channels: DownloadChannels,
        loaded_rx: mpsc::Receiver<LoadedPiece>,
    }

    async fn setup(content: &[u8], store: Arc<MemoryPieceStore>, registry: &LoadRegistry) -> Setup {
        let info = info_for(content);
        let cancel = CancellationToken::new();
        let entry = registry
            .add_load_entry("clip", cancel.clone(), info.num_pieces())
            .await
            .unwrap();

        let (peer_tx, peers) = mpsc::channel(8);
        let (dead_peers, dead_rx) = mpsc::channel(8);
        let (_priority_tx, priorities) = mpsc::unbounded_channel();
        let (loaded_tx, loaded_rx) = mpsc::channel(64);

        Setup {
            download: Download {
                id: "clip".to_string(),
                info,
                store: Arc::clone(&store),
                entry: Arc::clone(&entry),
                diagnostics: None,
                limits: PipelineLimits {
                    max_backlog: 3,
                    max_block_size: 8,
                },
                max_workers: 4,
                initial_target: 0,
            },
            store,
            entry,
            cancel,
            peer_tx,
            dead_rx,
            channels: DownloadChannels {
                peers,
                dead_peers,
                priorities,
                loaded: Some(loaded_tx),
            },
            loaded_rx,
        }
    }

    #[tokio::test]
    async fn test_downloads_everything_from_two_peers() {
        let data = content(300);
        let registry = LoadRegistry::new();
        let mut s = setup(&data, Arc::new(MemoryPieceStore::new()), &registry).await;

        let a = Seeder::start(data.clone(), PIECE_LEN, SeederBehavior::Honest).await;
        let b = Seeder::start(data.clone(), PIECE_LEN, SeederBehavior::Honest).await;
        s.peer_tx.send(connect_to(&a).await).await.unwrap();
        s.peer_tx.send(connect_to(&b).await).await.unwrap();

        s.download.run(s.channels).await.unwrap();

        assert_eq!(s.store.assembled("clip").await, data);
        assert_eq!(s.entry.loaded_percent().await, 100);
        assert_eq!(s.entry.count_done().await, 10);
        assert!(s.entry.stats().await.in_progress_pieces.is_empty());

        let mut announced = Vec::new();
        while let Ok(piece) = s.loaded_rx.try_recv() {
            assert_eq!(piece.offset, piece.index as u64 * PIECE_LEN as u64);
            announced.push(piece.index);
        }
        announced.sort_unstable();
        assert_eq!(announced, (0..10).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_cancel_then_resume_fetches_only_missing_pieces() {
        let data = content(320);
        let store = Arc::new(MemoryPieceStore::new());
        let registry = LoadRegistry::new();
        let first = setup(&data, Arc::clone(&store), &registry).await;

        let slow = Seeder::start(
            data.clone(),
            PIECE_LEN,
            SeederBehavior::Slow(Duration::from_millis(5)),
        )
        .await;
        first.peer_tx.send(connect_to(&slow).await).await.unwrap();

        let watched = Arc::clone(&store);
        let cancel = first.cancel.clone();
        let stopper = tokio::spawn(async move {
            while watched.loaded_indexes("clip").await.unwrap().len() < 6 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            cancel.cancel();
        });

        let result = first.download.run(first.channels).await;
        assert!(matches!(result, Err(BittorrentError::Cancelled)));
        stopper.await.unwrap();

        let saved = store.loaded_indexes("clip").await.unwrap();
        assert!(saved.len() >= 6 && saved.len() < 10, "saved {:?}", saved);
        assert!(registry.stop_load("clip").await);

        let second = setup(&data, Arc::clone(&store), &registry).await;
        let honest = Seeder::start(data.clone(), PIECE_LEN, SeederBehavior::Honest).await;
        second.peer_tx.send(connect_to(&honest).await).await.unwrap();
        second.download.run(second.channels).await.unwrap();

        assert_eq!(store.assembled("clip").await, data);
        for index in honest.requested_pieces().await {
            assert!(!saved.contains(&index), "piece {} fetched twice", index);
        }
    }

    #[tokio::test]
    async fn test_corrupt_persisted_piece_is_fetched_again() {
        let data = content(96);
        let store = Arc::new(MemoryPieceStore::new());
        let info = info_for(&data);
        for index in 0..3u32 {
            let (begin, end) = info.piece_bounds(index);
            store
                .save_part("clip", &data[begin as usize..end as usize], begin, end - begin, index)
                .await
                .unwrap();
        }
        store.corrupt("clip", 1).await;

        let registry = LoadRegistry::new();
        let mut s = setup(&data, Arc::clone(&store), &registry).await;
        let seeder = Seeder::start(data.clone(), PIECE_LEN, SeederBehavior::Honest).await;
        s.peer_tx.send(connect_to(&seeder).await).await.unwrap();

        s.download.run(s.channels).await.unwrap();

        assert_eq!(seeder.requested_pieces().await, vec![1]);
        assert_eq!(store.assembled("clip").await, data);
        let first = s.loaded_rx.recv().await.unwrap();
        assert_eq!(first.index, 0);
    }

    #[tokio::test]
    async fn test_fully_restored_load_needs_no_peers() {
        let data = content(64);
        let store = Arc::new(MemoryPieceStore::new());
        store.save_part("clip", &data[..32], 0, 32, 0).await.unwrap();
        store.save_part("clip", &data[32..], 32, 32, 1).await.unwrap();

        let registry = LoadRegistry::new();
        let s = setup(&data, store, &registry).await;
        s.download.run(s.channels).await.unwrap();
        assert_eq!(s.entry.stats().await.done_pieces, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_piece_missing_from_bitfield_goes_to_another_peer() {
        let data = content(256);
        let registry = LoadRegistry::new();
        let s = setup(&data, Arc::new(MemoryPieceStore::new()), &registry).await;

        let partial = Seeder::with_pieces(
            data.clone(),
            PIECE_LEN,
            &[0, 1, 2, 3, 4, 5, 6],
            SeederBehavior::Honest,
        )
        .await;
        let full = Seeder::start(data.clone(), PIECE_LEN, SeederBehavior::Honest).await;
        s.peer_tx.send(connect_to(&partial).await).await.unwrap();
        s.peer_tx.send(connect_to(&full).await).await.unwrap();

        s.download.run(s.channels).await.unwrap();

        assert!(!partial.requested_pieces().await.contains(&7));
        assert!(full.requested_pieces().await.contains(&7));
        assert_eq!(s.store.assembled("clip").await, data);
    }

    #[tokio::test]
    async fn test_dead_peer_is_reported_and_load_fails_without_peers() {
        let data = content(64);
        let registry = LoadRegistry::new();
        let mut s = setup(&data, Arc::new(MemoryPieceStore::new()), &registry).await;

        let flaky = Seeder::start(data.clone(), PIECE_LEN, SeederBehavior::HangUpAfter(1)).await;
        s.peer_tx.send(connect_to(&flaky).await).await.unwrap();
        drop(s.peer_tx);

        let result = s.download.run(s.channels).await;
        assert!(matches!(result, Err(BittorrentError::NoPeers(_))));

        let dead = s.dead_rx.recv().await.unwrap();
        assert_eq!(dead.addr, flaky.addr);
        assert!(dead.is_dead);
        assert_eq!(s.entry.stats().await.active_peers, 0);
    }

    #[tokio::test]
    async fn test_single_partial_peer_serves_what_it_has() {
        let data = content(256);
        let registry = LoadRegistry::new();
        let s = setup(&data, Arc::new(MemoryPieceStore::new()), &registry).await;

        // the target piece 0 is the one piece this peer lacks
        let partial = Seeder::with_pieces(
            data.clone(),
            PIECE_LEN,
            &[1, 2, 3, 4, 5, 6, 7],
            SeederBehavior::Honest,
        )
        .await;
        s.peer_tx.send(connect_to(&partial).await).await.unwrap();
        let running = tokio::spawn(s.download.run(s.channels));

        for _ in 0..200 {
            if s.store.loaded_indexes("clip").await.unwrap().len() == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut stored = s.store.loaded_indexes("clip").await.unwrap();
        stored.sort_unstable();
        assert_eq!(stored, (1..8).collect::<Vec<u32>>());
        assert_eq!(partial.requested_pieces().await, (1..8).collect::<Vec<u32>>());
        assert!(!running.is_finished());

        s.cancel.cancel();
        assert!(matches!(running.await.unwrap(), Err(BittorrentError::Cancelled)));
    }
}
