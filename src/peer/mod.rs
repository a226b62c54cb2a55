mod bitfield;
mod connection;
mod handshake;
mod message;

pub use bitfield::Bitfield;
pub use connection::PeerConnection;
pub use handshake::complete_handshake;
pub use message::{parse_piece, BlockInfo, Message};

#[cfg(test)]
pub(crate) use handshake::Handshake;
#[cfg(test)]
pub(crate) use message::read_message;

#[cfg(test)]
pub(crate) use connection::tests as test_support;

use rand::Rng;
use std::net::SocketAddr;

/// SHA-1 of the bencoded info dictionary.
pub type InfoHash = [u8; 20];
pub type PeerId = [u8; 20];

/// A peer in the swarm, as handed to us by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddr,
    pub is_dead: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            is_dead: false,
        }
    }
}

/// Generate a random peer ID
/// Format: -ST0001-<12 random chars>
pub fn generate_peer_id() -> PeerId {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-ST0001-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'z');
    }

    peer_id
}
