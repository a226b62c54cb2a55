use crate::config::ClientConfig;
use crate::download::{Download, DownloadChannels, PeerIntake};
use crate::error::Result;
use crate::loads::{LoadEntry, LoadRegistry};
use crate::peer::{generate_peer_id, InfoHash, Peer, PeerId};
use crate::piece::LoadedPiece;
use crate::storage::{FilePieceStore, FsWriter, PieceStore};
use crate::torrent::{Metainfo, TorrentInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// One download as asked for by a caller.
pub struct DownloadRequest {
    pub id: String,
    pub torrent: Metainfo,
    pub peers: Vec<Peer>,
    pub target: i64,
    pub priorities: mpsc::UnboundedReceiver<i64>,
    pub loaded: Option<mpsc::Sender<LoadedPiece>>,
}

impl DownloadRequest {
    /// A request keyed by the hex info hash, starting at piece 0.
    ///
    /// The returned sender moves the target piece while the download runs.
    pub fn new(torrent: Metainfo, peers: Vec<Peer>) -> (Self, mpsc::UnboundedSender<i64>) {
        let (priority_tx, priorities) = mpsc::unbounded_channel();
        let request = Self {
            id: torrent.info_hash_hex(),
            torrent,
            peers,
            target: 0,
            priorities,
            loaded: None,
        };
        (request, priority_tx)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_target(mut self, target: i64) -> Self {
        self.target = target;
        self
    }

    pub fn with_loaded(mut self, loaded: mpsc::Sender<LoadedPiece>) -> Self {
        self.loaded = Some(loaded);
        self
    }
}

/// Main BitTorrent client
pub struct TorrentClient<S: PieceStore> {
    config: ClientConfig,
    peer_id: PeerId,
    registry: Arc<LoadRegistry>,
    store: Arc<S>,
    writer: FsWriter,
}

impl TorrentClient<FilePieceStore> {
    /// A client that keeps pieces in files under the configured directories.
    pub async fn open(config: ClientConfig) -> Result<Self> {
        let (writer, _writer_task) = FsWriter::spawn(&config.download_dir, config.writer_queue);
        let store = FilePieceStore::open(&config.state_dir, writer.clone()).await?;
        Ok(Self::with_store(config, Arc::new(store), writer))
    }
}

impl<S: PieceStore> TorrentClient<S> {
    pub fn with_store(config: ClientConfig, store: Arc<S>, writer: FsWriter) -> Self {
        let peer_id = generate_peer_id();
        info!("Client initialized with peer_id: {}", hex::encode(peer_id));

        Self {
            config,
            peer_id,
            registry: Arc::new(LoadRegistry::new()),
            store,
            writer,
        }
    }

    pub fn registry(&self) -> Arc<LoadRegistry> {
        Arc::clone(&self.registry)
    }

    /// Download a torrent
    ///
    /// The load is registered under `request.id` for as long as this call
    /// runs; stopping it through the registry ends the call with
    /// [`crate::error::BittorrentError::Cancelled`].
    pub async fn download(&self, request: DownloadRequest) -> Result<()> {
        let DownloadRequest {
            id,
            torrent,
            peers,
            target,
            priorities,
            loaded,
        } = request;

        info!("Starting download {}", id);
        info!("Torrent: {}", torrent.info.name);
        info!("Total size: {} bytes", torrent.info.length);
        info!("Pieces: {}", torrent.info.num_pieces());
        info!("Info hash: {}", torrent.info_hash_hex());

        let entry = self
            .registry
            .add_load_entry(&id, CancellationToken::new(), torrent.info.num_pieces())
            .await?;
        let reporter = self.spawn_progress_reporter(&id);

        let channels = LoadChannels {
            peers,
            target,
            priorities,
            loaded,
        };
        let result = self
            .run_load(&id, torrent.info_hash, torrent.info, Arc::clone(&entry), channels)
            .await;

        reporter.abort();
        self.registry.stop_load(&id).await;
        result
    }

    async fn run_load(
        &self,
        id: &str,
        info_hash: InfoHash,
        info: TorrentInfo,
        entry: Arc<LoadEntry>,
        channels: LoadChannels,
    ) -> Result<()> {
        self.store.prepare(id, &info.name).await?;

        let (conn_tx, conn_rx) = mpsc::channel(self.config.max_workers.max(1));
        let (dead_tx, dead_rx) = mpsc::channel(channels.peers.len().max(1));

        let intake_cancel = entry.cancel_token().child_token();
        let intake = PeerIntake {
            info_hash,
            peer_id: self.peer_id,
            num_pieces: info.num_pieces(),
            timeouts: self.config.timeouts(),
            redial_attempts: self.config.redial_attempts,
            redial_delay: Duration::from_secs(self.config.redial_delay_secs),
            cancel: intake_cancel.clone(),
        }
        .spawn(channels.peers, dead_rx, conn_tx);

        let download = Download {
            id: id.to_string(),
            info,
            store: Arc::clone(&self.store),
            entry,
            diagnostics: Some(self.writer.clone()),
            limits: self.config.pipeline(),
            max_workers: self.config.max_workers,
            initial_target: channels.target,
        };
        let result = download
            .run(DownloadChannels {
                peers: conn_rx,
                dead_peers: dead_tx,
                priorities: channels.priorities,
                loaded: channels.loaded,
            })
            .await;

        intake_cancel.cancel();
        if let Err(e) = intake.await {
            error!("Peer intake for {} panicked: {}", id, e);
        }
        result
    }

    fn spawn_progress_reporter(&self, id: &str) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(stats) = registry.get_stats_for_entry(&id).await else {
                    break;
                };
                info!(
                    "Load {}: {}% ({}/{} pieces), {} in flight, {} active peers",
                    id,
                    stats.loaded_percent,
                    stats.done_pieces.len(),
                    stats.total_pieces,
                    stats.in_progress_pieces.len(),
                    stats.active_peers
                );
            }
        })
    }

    /// Stop every running download.
    pub async fn close(&self) {
        let running = self.registry.ids().await;
        if !running.is_empty() {
            info!("Stopping loads: {}", running.join(", "));
        }
        self.registry.close().await;
    }
}

struct LoadChannels {
    peers: Vec<Peer>,
    target: i64,
    priorities: mpsc::UnboundedReceiver<i64>,
    loaded: Option<mpsc::Sender<LoadedPiece>>,
}
