use std::collections::VecDeque;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::metadata::file::TorrentFile;
use crate::peer::connection::{PeerConnection, PeerError};
use crate::peer::message::Message;
use crate::util::io::PieceSink;
use crate::util::sha1::{sha1_hash, SHA1_LEN};

pub const BLOCK_SIZE: u32 = 16 * 1024;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("piece {index} failed hash verification")]
    PieceHashMismatch { index: u32 },
    #[error("piece {index} is out of range, torrent has {num_pieces} pieces")]
    PieceOutOfRange { index: u32, num_pieces: u32 },
    #[error("unable to store piece: {0}")]
    Sink(#[from] std::io::Error),
}

/// Collects the blocks of one piece. Blocks land at their own offset so
/// duplicates and out-of-order arrivals simply overwrite.
#[derive(Debug)]
pub struct PieceAssemblyBuffer {
    index: u32,
    expected_length: u32,
    data: Vec<u8>,
    received: Vec<bool>,
    num_received: usize,
    next_block_offset: u32,
    retry: VecDeque<u32>,
}

impl PieceAssemblyBuffer {
    pub fn new(index: u32, expected_length: u32) -> Self {
        let num_blocks = expected_length.div_ceil(BLOCK_SIZE) as usize;
        PieceAssemblyBuffer {
            index,
            expected_length,
            data: vec![0; expected_length as usize],
            received: vec![false; num_blocks],
            num_received: 0,
            next_block_offset: 0,
            retry: VecDeque::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn expected_length(&self) -> u32 {
        self.expected_length
    }

    pub fn next_block_offset(&self) -> u32 {
        self.next_block_offset
    }

    pub fn num_blocks(&self) -> usize {
        self.received.len()
    }

    /// Length of the block starting at `begin`, if `begin` is a block boundary.
    pub fn block_length(&self, begin: u32) -> Option<u32> {
        if begin % BLOCK_SIZE != 0 || begin >= self.expected_length {
            return None;
        }
        Some(BLOCK_SIZE.min(self.expected_length - begin))
    }

    fn is_received(&self, begin: u32) -> bool {
        self.received[(begin / BLOCK_SIZE) as usize]
    }

    /// Next `(begin, length)` to ask for: re-queued blocks first, then the cursor.
    pub fn next_request(&mut self) -> Option<(u32, u32)> {
        while let Some(begin) = self.retry.pop_front() {
            if !self.is_received(begin) {
                return self.block_length(begin).map(|length| (begin, length));
            }
        }
        let begin = self.next_block_offset;
        let length = self.block_length(begin)?;
        self.next_block_offset += length;
        Some((begin, length))
    }

    /// Puts an unanswered request back in line.
    pub fn requeue(&mut self, begin: u32) {
        if self.block_length(begin).is_some() && !self.is_received(begin) && !self.retry.contains(&begin) {
            self.retry.push_back(begin);
        }
    }

    /// Stores a block. Returns false, leaving the buffer as it was, when the
    /// offset or length does not line up with a block of this piece.
    pub fn add_block(&mut self, begin: u32, block: &[u8]) -> bool {
        match self.block_length(begin) {
            Some(length) if length as usize == block.len() => {
                let start = begin as usize;
                self.data[start..start + block.len()].copy_from_slice(block);
                let slot = (begin / BLOCK_SIZE) as usize;
                if !self.received[slot] {
                    self.received[slot] = true;
                    self.num_received += 1;
                }
                true
            },
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.num_received == self.received.len()
    }

    /// Hands back the piece if every block arrived and the digest matches.
    pub fn verify(self, expected: &[u8; SHA1_LEN]) -> Result<Vec<u8>, DownloadError> {
        if !self.is_complete() || sha1_hash(&self.data) != *expected {
            return Err(DownloadError::PieceHashMismatch { index: self.index });
        }
        Ok(self.data)
    }
}

/// Downloads and verifies one piece of known length and digest.
pub async fn fetch_piece<S>(
    conn: &mut PeerConnection<S>,
    index: u32,
    length: u32,
    expected_hash: &[u8; SHA1_LEN],
) -> Result<Vec<u8>, DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if conn.availability_known() && !conn.has_piece(index) {
        return Err(PeerError::PeerLacksPiece { index }.into());
    }
    conn.wait_for_unchoke().await?;
    if !conn.has_piece(index) {
        return Err(PeerError::PeerLacksPiece { index }.into());
    }

    let depth = conn.config().pipeline_depth.max(1);
    let mut buffer = PieceAssemblyBuffer::new(index, length);
    let mut in_flight: Vec<u32> = Vec::with_capacity(depth);
    let mut choked_since_requests = false;
    debug!(peer = %conn.label(), index, length, blocks = buffer.num_blocks(), "downloading piece");

    while !buffer.is_complete() {
        while !conn.peer_choking() && in_flight.len() < depth {
            let Some((begin, block_length)) = buffer.next_request() else {
                break;
            };
            conn.request(index, begin, block_length).await?;
            in_flight.push(begin);
        }

        match conn.next_message().await? {
            Message::Piece { index: piece, begin, block } if piece == index => {
                if buffer.add_block(begin, &block) {
                    in_flight.retain(|&b| b != begin);
                } else {
                    warn!(peer = %conn.label(), index, begin, len = block.len(), "discarding misaligned block");
                }
            },
            Message::Piece { index: piece, begin, .. } => {
                debug!(peer = %conn.label(), piece, begin, "discarding block for another piece");
            },
            Message::Choke => choked_since_requests |= !in_flight.is_empty(),
            Message::Unchoke if choked_since_requests => {
                // The choke dropped the peer's request queue; ask again for anything unanswered.
                choked_since_requests = false;
                for begin in in_flight.drain(..) {
                    buffer.requeue(begin);
                }
            },
            _ => (),
        }
    }

    let data = buffer.verify(expected_hash)?;
    info!(peer = %conn.label(), index, length, "piece verified");
    Ok(data)
}

/// Downloads piece `index` of `torrent`.
pub async fn download_piece<S>(
    conn: &mut PeerConnection<S>,
    torrent: &TorrentFile,
    index: u32,
) -> Result<Vec<u8>, DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (length, hash) = match (torrent.piece_len(index), torrent.piece_hash(index)) {
        (Some(length), Some(hash)) => (length, hash),
        _ => return Err(DownloadError::PieceOutOfRange { index, num_pieces: torrent.num_pieces() }),
    };
    fetch_piece(conn, index, length, hash).await
}

/// Downloads every piece from `*next` onwards in index order, appending each
/// verified piece to `sink`. `*next` tracks progress so a caller can resume
/// on another connection after a failure.
pub async fn download_from<S>(
    conn: &mut PeerConnection<S>,
    torrent: &TorrentFile,
    next: &mut u32,
    sink: &mut dyn PieceSink,
) -> Result<(), DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let retries = conn.config().piece_retries;
    while *next < torrent.num_pieces() {
        let index = *next;
        let mut attempt = 0;
        let bytes = loop {
            match download_piece(conn, torrent, index).await {
                Ok(bytes) => break bytes,
                Err(DownloadError::PieceHashMismatch { .. }) if attempt < retries => {
                    attempt += 1;
                    warn!(peer = %conn.label(), index, attempt, "hash mismatch, retrying piece");
                },
                Err(e) => return Err(e),
            }
        };
        sink.append_piece(index, &bytes).await?;
        *next += 1;
    }
    sink.finish().await?;
    Ok(())
}

/// Downloads the whole torrent from one peer, piece by piece.
pub async fn download_all<S>(
    conn: &mut PeerConnection<S>,
    torrent: &TorrentFile,
    sink: &mut dyn PieceSink,
) -> Result<(), DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut next = 0;
    download_from(conn, torrent, &mut next, sink).await
}
