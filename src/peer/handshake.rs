use super::{InfoHash, PeerId};
use crate::error::{BittorrentError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    /// 1 + 19 + 8 + 20 + 20 = 68 bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + PROTOCOL_STRING.len());
        buf.push(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Read a handshake whose pstr length is announced by the first byte.
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let pstrlen = reader.read_u8().await? as usize;
        if pstrlen == 0 {
            return Err(BittorrentError::Protocol(
                "handshake pstrlen cannot be 0".to_string(),
            ));
        }

        let mut rest = vec![0u8; pstrlen + 48];
        reader.read_exact(&mut rest).await?;

        if &rest[..pstrlen] != PROTOCOL_STRING {
            return Err(BittorrentError::Protocol(format!(
                "unsupported protocol {:?}",
                String::from_utf8_lossy(&rest[..pstrlen])
            )));
        }

        // reserved bytes at [pstrlen..pstrlen + 8] are ignored
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[pstrlen + 8..pstrlen + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[pstrlen + 28..pstrlen + 48]);

        Ok(Self { info_hash, peer_id })
    }
}

/// Send our handshake, read theirs and check that both name the same torrent.
///
/// The whole exchange is bounded by `limit`; on expiry the caller is expected
/// to drop the stream.
pub async fn complete_handshake<S>(
    stream: &mut S,
    info_hash: InfoHash,
    peer_id: PeerId,
    limit: Duration,
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let ours = Handshake::new(info_hash, peer_id).to_bytes();
        stream.write_all(&ours).await?;
        debug!("Wrote handshake ({} bytes)", ours.len());

        let theirs = Handshake::read(stream).await?;
        if theirs.info_hash != info_hash {
            return Err(BittorrentError::InfoHashMismatch);
        }
        Ok(theirs)
    };

    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| BittorrentError::Timeout("handshake"))?
}
