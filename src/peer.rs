mod connection;
mod downloader;
mod handshake;
mod message;


pub use connection::{ConnectionState, PeerConfig, PeerConnection, PeerError};
pub use downloader::{download_all, download_from, download_piece, fetch_piece, DownloadError, PieceAssemblyBuffer, BLOCK_SIZE};
pub use handshake::{Handshake, HandshakeError, HANDSHAKE_LEN};
pub use message::{Message, MessageError, MessageId};

/// Which pieces a peer has. Index 0 is the most significant bit of byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    masks: Vec<u8>,
    num: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldError {
    Unrepresentible { num_fields: usize, num_elements: usize },
}

impl Bitfield {
    pub fn new(num: usize, set: bool) -> Self {
        let num_elements = num.div_ceil(8);
        let masks = if set { vec![0xFF; num_elements] } else { vec![0; num_elements] };
        let mut bf = Bitfield { masks, num };
        bf.clear_spare_bits();
        bf
    }

    /// Builds a bitfield from a `bitfield` message payload. Longer payloads are
    /// truncated and spare trailing bits are cleared.
    pub fn try_from_vec(mut v: Vec<u8>, num: usize) -> Result<Self, BitfieldError> {
        let num_elements = num.div_ceil(8);
        if v.len() < num_elements {
            return Err(BitfieldError::Unrepresentible { num_fields: num, num_elements: v.len() });
        }
        v.truncate(num_elements);
        let mut bf = Bitfield { masks: v, num };
        bf.clear_spare_bits();
        Ok(bf)
    }

    fn clear_spare_bits(&mut self) {
        let extra = self.num % 8;
        if extra != 0 {
            if let Some(last) = self.masks.last_mut() {
                *last &= 0xFFu8 << (8 - extra);
            }
        }
    }

    fn locate(index: usize) -> (usize, u8) {
        (index / 8, 1 << (7 - index % 8))
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// Out-of-range indices are reported as absent.
    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.num {
            return false;
        }
        let (element, mask) = Self::locate(index);
        self.masks[element] & mask == mask
    }

    /// Returns false when `index` is out of range.
    pub fn mark_piece(&mut self, index: usize) -> bool {
        if index >= self.num {
            return false;
        }
        let (element, mask) = Self::locate(index);
        self.masks[element] |= mask;
        true
    }

    pub fn num_set(&self) -> usize {
        self.masks.iter().map(|mask| mask.count_ones() as usize).sum()
    }

    pub fn all(&self) -> bool {
        self.num_set() == self.num
    }

    pub fn none(&self) -> bool {
        self.masks.iter().all(|&e| e == 0x00)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.masks
    }
}
