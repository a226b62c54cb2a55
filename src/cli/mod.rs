use crate::client::{DownloadRequest, TorrentClient};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::peer::Peer;
use crate::piece::{piece_for_byte, LoadedPiece};
use crate::storage::{FilePieceStore, FsWriter, MemoryPieceStore, PieceStore};
use crate::torrent::{load_torrent_file, Metainfo};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "streamtorrent")]
#[command(about = "A streaming-first BitTorrent downloader", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent file
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Peer to fetch from (repeatable)
        #[arg(short, long = "peer", required = true)]
        peers: Vec<SocketAddr>,

        /// Download directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Load id, defaults to the hex info hash
        #[arg(long)]
        id: Option<String>,

        /// Piece to start from
        #[arg(long, default_value = "0")]
        target: i64,

        /// Maximum number of peers to download from at once
        #[arg(short, long)]
        max_workers: Option<usize>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Read new target pieces from stdin, one per line
        #[arg(long)]
        stdin_targets: bool,

        /// Treat stdin targets as byte offsets into the file
        #[arg(long, requires = "stdin_targets")]
        byte_offsets: bool,

        /// Keep downloaded pieces in memory only
        #[arg(long)]
        dry_run: bool,

        /// Print `piece <index> <offset> <length>` for every piece in place
        #[arg(long)]
        report_pieces: bool,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,
    },

    /// Show which pieces of a torrent are already stored
    Status {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Load id, defaults to the hex info hash
        #[arg(long)]
        id: Option<String>,

        /// Download directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                peers,
                output,
                id,
                target,
                max_workers,
                config,
                stdin_targets,
                byte_offsets,
                dry_run,
                report_pieces,
            } => {
                let mut config = load_config(config.as_deref(), output.as_deref()).await?;
                if let Some(max_workers) = max_workers {
                    config.max_workers = (*max_workers).max(1);
                }

                let metainfo = load_torrent_file(torrent).await?;
                let piece_length = metainfo.info.piece_length;
                let peers = peers.iter().copied().map(Peer::new).collect();

                let (request, priorities) = DownloadRequest::new(metainfo, peers);
                let mut request = request.with_target(*target);
                if let Some(id) = id {
                    request = request.with_id(id.clone());
                }

                if *stdin_targets {
                    let per_piece = if *byte_offsets { Some(piece_length) } else { None };
                    tokio::spawn(forward_stdin_targets(priorities, per_piece));
                }
                if *report_pieces {
                    let (loaded_tx, loaded_rx) = mpsc::channel(64);
                    request = request.with_loaded(loaded_tx);
                    tokio::spawn(report_loaded_pieces(loaded_rx));
                }

                if *dry_run {
                    let (writer, _writer_task) =
                        FsWriter::spawn(&config.download_dir, config.writer_queue);
                    let store = Arc::new(MemoryPieceStore::new());
                    let client = TorrentClient::with_store(config, store, writer);
                    run_download(client, request).await?;
                } else {
                    run_download(TorrentClient::open(config).await?, request).await?;
                }
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }

            Commands::Status {
                torrent,
                id,
                output,
                config,
            } => {
                let config = load_config(config.as_deref(), output.as_deref()).await?;
                self.show_status(torrent, id.as_deref(), &config).await?;
            }
        }

        Ok(())
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let metainfo = load_torrent_file(torrent_path).await?;

        println!("Torrent Information");
        println!("==================");
        println!("Name: {}", metainfo.info.name);
        if let Some(announce) = &metainfo.announce {
            println!("Tracker: {}", announce);
        }
        println!("Total Size: {} bytes", metainfo.info.length);
        println!("Piece Length: {} bytes", metainfo.info.piece_length);
        println!("Number of Pieces: {}", metainfo.info.num_pieces());
        println!("Info Hash: {}", metainfo.info_hash_hex());

        if !metainfo.info.files.is_empty() {
            println!("\nFiles:");
            for (i, file) in metainfo.info.files.iter().enumerate() {
                println!(
                    "  {}: {} ({} bytes)",
                    i + 1,
                    file.path.join("/"),
                    file.length
                );
            }
        }

        Ok(())
    }

    async fn show_status(&self, torrent_path: &Path, id: Option<&str>, config: &ClientConfig) -> Result<()> {
        let metainfo = load_torrent_file(torrent_path).await?;
        let id = id.map(String::from).unwrap_or_else(|| metainfo.info_hash_hex());

        let (writer, _writer_task) = FsWriter::spawn(&config.download_dir, 1);
        let store = FilePieceStore::open(&config.state_dir, writer).await?;
        let mut stored = store.loaded_indexes(&id).await?;
        stored.sort_unstable();

        let total = metainfo.info.num_pieces();
        let percent = if total == 0 { 100 } else { stored.len() * 100 / total };
        println!("Load: {}", id);
        println!("Stored: {}/{} pieces ({}%)", stored.len(), total, percent);
        println!("Missing: {}", format_ranges(&missing_pieces(&metainfo, &stored)));

        Ok(())
    }
}

/// Run one download until it finishes or Ctrl-C stops it.
async fn run_download<S: PieceStore>(client: TorrentClient<S>, request: DownloadRequest) -> Result<()> {
    let load_id = request.id.clone();
    let registry = client.registry();
    let stop_id = load_id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && registry.is_active(&stop_id).await {
            warn!("Interrupted, stopping load {}", stop_id);
            registry.stop_load(&stop_id).await;
        }
    });

    let result = client.download(request).await;
    interrupt.abort();
    client.close().await;

    match result {
        Ok(()) => println!("Download {} complete", load_id),
        Err(e) if e.is_cancelled() => {
            println!("Download {} stopped, run again to resume", load_id)
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Read the config file if one is given; `--output` moves both directories.
async fn load_config(path: Option<&Path>, output: Option<&Path>) -> Result<ClientConfig> {
    let mut config = match path {
        Some(path) => ClientConfig::load(path).await?,
        None => ClientConfig::default(),
    };
    if let Some(output) = output {
        config.download_dir = output.to_path_buf();
        config.state_dir = output.join(".state");
    }
    Ok(config)
}

async fn forward_stdin_targets(priorities: mpsc::UnboundedSender<i64>, piece_length: Option<u64>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let target = match (line.parse::<u64>(), piece_length) {
            (Ok(offset), Some(piece_length)) => piece_for_byte(offset, piece_length),
            (Ok(index), None) => index as i64,
            (Err(_), _) => {
                warn!("Ignoring target {:?}", line);
                continue;
            }
        };
        info!("New target piece {}", target);
        if priorities.send(target).is_err() {
            break;
        }
    }
}

async fn report_loaded_pieces(mut loaded: mpsc::Receiver<LoadedPiece>) {
    while let Some(piece) = loaded.recv().await {
        println!("{}", piece_line(&piece));
    }
}

fn piece_line(piece: &LoadedPiece) -> String {
    format!("piece {} {} {}", piece.index, piece.offset, piece.len)
}

fn missing_pieces(metainfo: &Metainfo, stored: &[u32]) -> Vec<u32> {
    (0..metainfo.info.num_pieces() as u32)
        .filter(|i| stored.binary_search(i).is_err())
        .collect()
}

/// `[0, 1, 2, 5, 7, 8]` -> `0-2, 5, 7-8`
fn format_ranges(indexes: &[u32]) -> String {
    if indexes.is_empty() {
        return "none".to_string();
    }

    let mut parts = Vec::new();
    let mut start = indexes[0];
    let mut prev = start;
    for &index in &indexes[1..] {
        if index != prev + 1 {
            parts.push(range_text(start, prev));
            start = index;
        }
        prev = index;
    }
    parts.push(range_text(start, prev));
    parts.join(", ")
}

fn range_text(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}
