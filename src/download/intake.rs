use crate::config::EngineTimeouts;
use crate::error::{BittorrentError, Result};
use crate::peer::{InfoHash, Peer, PeerConnection, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dials peers and feeds activated connections to a download.
///
/// A peer reported dead is dialed again after `redial_delay`, at most
/// `redial_attempts` times. The intake ends when it is cancelled, when the
/// download stops listening, or when it has neither live connections nor
/// pending dials left; closing the connection channel then tells the
/// download that no more peers are coming.
#[derive(Debug, Clone)]
pub struct PeerIntake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub num_pieces: usize,
    pub timeouts: EngineTimeouts,
    pub redial_attempts: u32,
    pub redial_delay: Duration,
    pub cancel: CancellationToken,
}

type DialOutcome = (Peer, Result<PeerConnection>);

impl PeerIntake {
    pub fn spawn(
        self,
        peers: Vec<Peer>,
        dead_peers: mpsc::Receiver<Peer>,
        activated: mpsc::Sender<PeerConnection>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(peers, dead_peers, activated))
    }

    async fn run(
        self,
        peers: Vec<Peer>,
        mut dead_peers: mpsc::Receiver<Peer>,
        activated: mpsc::Sender<PeerConnection>,
    ) {
        let mut dials: JoinSet<DialOutcome> = JoinSet::new();
        let mut redials: HashMap<SocketAddr, u32> = HashMap::new();
        let mut live = 0usize;

        info!("Dialing {} peers", peers.len());
        for peer in peers {
            dials.spawn(self.clone().dial(peer, Duration::ZERO));
        }

        loop {
            if dials.is_empty() && live == 0 {
                warn!("No peers left to dial");
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                dead = dead_peers.recv() => match dead {
                    Some(peer) => {
                        live = live.saturating_sub(1);
                        self.schedule_redial(&mut dials, &mut redials, peer);
                    }
                    None => {
                        debug!("Download stopped reporting dead peers");
                        break;
                    }
                },
                Some(joined) = dials.join_next(), if !dials.is_empty() => {
                    let Ok((peer, outcome)) = joined else {
                        continue;
                    };
                    match outcome {
                        Ok(conn) => {
                            let sent = tokio::select! {
                                _ = self.cancel.cancelled() => false,
                                sent = activated.send(conn) => sent.is_ok(),
                            };
                            if !sent {
                                break;
                            }
                            live += 1;
                        }
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            warn!("Could not activate peer {}: {}", peer.addr, e);
                            self.schedule_redial(&mut dials, &mut redials, peer);
                        }
                    }
                }
            }
        }

        dials.abort_all();
    }

    fn schedule_redial(
        &self,
        dials: &mut JoinSet<DialOutcome>,
        redials: &mut HashMap<SocketAddr, u32>,
        mut peer: Peer,
    ) {
        let attempts = redials.entry(peer.addr).or_insert(0);
        if *attempts >= self.redial_attempts {
            info!("Giving up on peer {} after {} redials", peer.addr, attempts);
            return;
        }
        *attempts += 1;
        peer.is_dead = false;
        debug!("Redialing {} in {:?} (attempt {})", peer.addr, self.redial_delay, attempts);
        dials.spawn(self.clone().dial(peer, self.redial_delay));
    }

    /// Connect, declare interest and wait for the peer to unchoke us.
    async fn dial(self, peer: Peer, delay: Duration) -> DialOutcome {
        if !delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => return (peer, Err(BittorrentError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let outcome = async {
            let mut conn =
                PeerConnection::connect(
                    peer.clone(),
                    self.info_hash,
                    self.peer_id,
                    self.num_pieces,
                    self.timeouts,
                )
                .await?;
            conn.send_interested().await?;
            conn.wait_for_unchoke(&self.cancel).await?;
            Ok::<_, BittorrentError>(conn)
        }
        .await;

        (peer, outcome)
    }
}
