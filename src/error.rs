use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    Bencode(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Peer transport error: {0}")]
    Transport(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Peer answered with a different info hash")]
    InfoHashMismatch,

    #[error("Choked by peer while downloading piece {index}")]
    Choked { index: u32 },

    #[error("Piece {index} failed integrity check")]
    Integrity { index: u32 },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Load {0} already exists")]
    LoadExists(String),

    #[error("Load {0} not found")]
    LoadNotFound(String),

    #[error("No usable peers left for load {0}")]
    NoPeers(String),

    #[error("Load terminated by context")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BittorrentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BittorrentError::Cancelled)
    }

    /// Failures that leave the peer connection unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BittorrentError::Transport(_) | BittorrentError::Timeout(_) | BittorrentError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
