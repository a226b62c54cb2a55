use crate::error::{BittorrentError, Result};

/// Pieces a peer advertises, one bit per piece, most significant bit first.
///
/// Sized for one torrent: the byte vector never grows past
/// `pieces.div_ceil(8)` whatever the peer announces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    pieces: usize,
}

impl Bitfield {
    /// An all-zero bitfield for a torrent of `pieces` pieces.
    #[cfg(test)]
    pub fn with_pieces(pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; pieces.div_ceil(8)],
            pieces,
        }
    }

    /// Take the bitfield a peer sent for a torrent of `pieces` pieces.
    ///
    /// A short field is padded with zeroes and spare bits past the last
    /// piece are cleared. A field longer than the torrent needs is rejected.
    pub fn from_peer(mut bytes: Vec<u8>, pieces: usize) -> Result<Self> {
        let expected = pieces.div_ceil(8);
        if bytes.len() > expected {
            return Err(BittorrentError::MalformedMessage(format!(
                "bitfield of {} bytes for {} pieces",
                bytes.len(),
                pieces
            )));
        }
        bytes.resize(expected, 0);

        let spare = expected * 8 - pieces;
        if let Some(last) = bytes.last_mut() {
            *last &= 0xffu8.checked_shl(spare as u32).unwrap_or(0);
        }
        Ok(Self { bytes, pieces })
    }

    pub fn has(&self, index: u32) -> bool {
        if index as usize >= self.pieces {
            return false;
        }
        let bit_index = 7 - (index % 8);
        (self.bytes[index as usize / 8] >> bit_index) & 1 == 1
    }

    /// Mark `index` present. Indexes outside the torrent are rejected.
    pub fn set(&mut self, index: u32) -> Result<()> {
        if index as usize >= self.pieces {
            return Err(BittorrentError::MalformedMessage(format!(
                "piece index {} out of range ({} pieces)",
                index, self.pieces
            )));
        }
        let bit_index = 7 - (index % 8);
        self.bytes[index as usize / 8] |= 1 << bit_index;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
