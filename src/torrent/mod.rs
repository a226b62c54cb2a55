mod metainfo;

pub use metainfo::{Metainfo, TorrentInfo};

#[cfg(test)]
pub(crate) use metainfo::tests;

use crate::error::Result;
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<Metainfo> {
    let data = fs::read(path).await?;
    Metainfo::from_bytes(&data)
}
