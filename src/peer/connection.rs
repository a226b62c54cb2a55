use super::message::{parse_have, read_message};
use super::{complete_handshake, Bitfield, BlockInfo, InfoHash, Message, Peer, PeerId};
use crate::config::EngineTimeouts;
use crate::error::{BittorrentError, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// An established, handshaken link to one peer.
///
/// Only a fully set up connection is ever handed out; the transport is
/// closed when this value is dropped.
pub struct PeerConnection {
    peer: Peer,
    stream: TcpStream,
    choked: bool,
    bitfield: Bitfield,
    remote_id: PeerId,
    timeouts: EngineTimeouts,
}

impl PeerConnection {
    /// Dial a peer, handshake, and receive its bitfield.
    ///
    /// `num_pieces` bounds every piece index the peer may announce.
    pub async fn connect(
        peer: Peer,
        info_hash: InfoHash,
        peer_id: PeerId,
        num_pieces: usize,
        timeouts: EngineTimeouts,
    ) -> Result<Self> {
        debug!("Connecting to peer: {}", peer.addr);

        let stream = tokio::time::timeout(timeouts.dial, TcpStream::connect(peer.addr))
            .await
            .map_err(|_| BittorrentError::Timeout("dial"))?
            .map_err(|e| {
                BittorrentError::Transport(format!("failed to connect to {}: {}", peer.addr, e))
            })?;

        Self::establish(stream, peer, info_hash, peer_id, num_pieces, timeouts).await
    }

    /// Run the setup protocol over an already open stream.
    pub async fn establish(
        mut stream: TcpStream,
        peer: Peer,
        info_hash: InfoHash,
        peer_id: PeerId,
        num_pieces: usize,
        timeouts: EngineTimeouts,
    ) -> Result<Self> {
        let remote =
            complete_handshake(&mut stream, info_hash, peer_id, timeouts.handshake).await?;
        let bitfield = recv_bitfield(&mut stream, num_pieces, timeouts.bitfield).await?;

        info!(
            "Connected to peer {} ({}, {}/{} pieces advertised)",
            peer.addr,
            String::from_utf8_lossy(&remote.peer_id[..8]),
            bitfield.count(),
            num_pieces
        );

        Ok(Self {
            peer,
            stream,
            choked: true,
            bitfield,
            remote_id: remote.peer_id,
            timeouts,
        })
    }

    /// Read one message, bounded by `limit`. Keep-alives come back as `None`.
    ///
    /// Choke, unchoke and have messages are applied to the local state
    /// before they are returned.
    pub async fn read(&mut self, limit: Duration) -> Result<Option<Message>> {
        let message = tokio::time::timeout(limit, read_message(&mut self.stream))
            .await
            .map_err(|_| BittorrentError::Timeout("peer read"))??;

        if let Some(message) = &message {
            self.handle_message(message)?;
        }
        Ok(message)
    }

    fn handle_message(&mut self, message: &Message) -> Result<()> {
        match message {
            Message::Choke => self.choked = true,
            Message::Unchoke => self.choked = false,
            Message::Have { .. } => self.bitfield.set(parse_have(message)?)?,
            _ => {}
        }
        Ok(())
    }

    /// Write one message, bounded by the write timeout.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        tokio::time::timeout(self.timeouts.write, self.stream.write_all(&message.to_bytes()))
            .await
            .map_err(|_| BittorrentError::Timeout("peer write"))??;
        debug!("Sent message ID {} to {}", message.id(), self.peer.addr);
        Ok(())
    }

    pub async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(&Message::Request {
            block: BlockInfo::new(index, begin, length),
        })
        .await
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.send(&Message::Interested).await
    }

    pub async fn send_not_interested(&mut self) -> Result<()> {
        self.send(&Message::NotInterested).await
    }

    pub async fn send_unchoke(&mut self) -> Result<()> {
        self.send(&Message::Unchoke).await
    }

    pub async fn send_have(&mut self, index: u32) -> Result<()> {
        self.send(&Message::Have { piece_index: index }).await
    }

    /// Keep poking the peer until it unchokes us.
    pub async fn wait_for_unchoke(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(BittorrentError::Cancelled);
            }

            self.send_unchoke().await?;

            let limit = self.timeouts.unchoke;
            let message = tokio::select! {
                _ = cancel.cancelled() => return Err(BittorrentError::Cancelled),
                message = self.read(limit) => message?,
            };

            if let Some(Message::Unchoke) = message {
                info!("Got UNCHOKE from {}", self.short_info());
                return Ok(());
            }
        }
    }

    /// Pieces the peer has advertised so far.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index)
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn timeouts(&self) -> &EngineTimeouts {
        &self.timeouts
    }

    pub fn short_info(&self) -> String {
        format!(
            "peer addr={}, id={}, choked={}",
            self.peer.addr,
            String::from_utf8_lossy(&self.remote_id[..8]),
            self.choked
        )
    }
}

async fn recv_bitfield(stream: &mut TcpStream, num_pieces: usize, limit: Duration) -> Result<Bitfield> {
    let message = tokio::time::timeout(limit, read_message(stream))
        .await
        .map_err(|_| BittorrentError::Timeout("bitfield"))??;

    match message {
        Some(Message::Bitfield { bitfield }) => Bitfield::from_peer(bitfield, num_pieces),
        Some(other) => Err(BittorrentError::Protocol(format!(
            "expected bitfield but got ID {}",
            other.id()
        ))),
        None => Err(BittorrentError::Protocol(
            "expected bitfield but got keep-alive".to_string(),
        )),
    }
}
