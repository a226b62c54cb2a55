use crate::error::{BittorrentError, Result};
use crate::piece::{MAX_BACKLOG, MAX_BLOCK_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the BitTorrent client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    /// Where the persisted piece index of every load lives.
    pub state_dir: PathBuf,
    pub max_workers: usize,
    pub max_backlog: usize,
    pub max_block_size: u32,
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub bitfield_timeout_secs: u64,
    pub unchoke_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub redial_attempts: u32,
    pub redial_delay_secs: u64,
    pub writer_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            state_dir: PathBuf::from("./downloads/.state"),
            max_workers: 40,
            max_backlog: MAX_BACKLOG,
            max_block_size: MAX_BLOCK_SIZE,
            dial_timeout_secs: 10,
            handshake_timeout_secs: 3,
            bitfield_timeout_secs: 5,
            unchoke_timeout_secs: 15,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
            redial_attempts: 3,
            redial_delay_secs: 5,
            writer_queue: 1000,
        }
    }
}

impl ClientConfig {
    /// Load a TOML file; keys it leaves out keep their defaults.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&raw)
            .map_err(|e| BittorrentError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| BittorrentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(BittorrentError::Config("max_workers must be > 0".to_string()));
        }
        if self.max_backlog == 0 {
            return Err(BittorrentError::Config("max_backlog must be > 0".to_string()));
        }
        if self.max_block_size == 0 {
            return Err(BittorrentError::Config(
                "max_block_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> EngineTimeouts {
        EngineTimeouts {
            dial: Duration::from_secs(self.dial_timeout_secs),
            handshake: Duration::from_secs(self.handshake_timeout_secs),
            bitfield: Duration::from_secs(self.bitfield_timeout_secs),
            unchoke: Duration::from_secs(self.unchoke_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
        }
    }

    pub fn pipeline(&self) -> PipelineLimits {
        PipelineLimits {
            max_backlog: self.max_backlog,
            max_block_size: self.max_block_size,
        }
    }
}

/// Per-step bounds on blocking peer I/O.
#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    pub dial: Duration,
    pub handshake: Duration,
    pub bitfield: Duration,
    pub unchoke: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        ClientConfig::default().timeouts()
    }
}

/// Shape of the block request pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_backlog: usize,
    pub max_block_size: u32,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        ClientConfig::default().pipeline()
    }
}
