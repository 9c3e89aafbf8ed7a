use thiserror::Error;

use crate::metadata::bencode::BencodeError;
use crate::metadata::file::MetadataError;
use crate::metadata::tracker::TrackerError;
use crate::peer::{DownloadError, PeerError};

/// Coarse classification used to decide whether another peer is worth trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bencode.
    Codec,
    /// A torrent that decodes but does not describe a usable download.
    Metadata,
    /// The peer broke the wire protocol.
    Protocol,
    /// The peer is choking us or does not have the piece.
    FlowControl,
    /// Data failed SHA-1 verification.
    Integrity,
    /// The connection failed, timed out or was closed.
    Transport,
    Tracker,
    /// Local file access.
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("tracker returned no peers")]
    NoPeers,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Bencode(_) => ErrorKind::Codec,
            Error::Metadata(MetadataError::Bencode(_)) => ErrorKind::Codec,
            Error::Metadata(MetadataError::Io(_)) => ErrorKind::Io,
            Error::Metadata(_) => ErrorKind::Metadata,
            Error::Tracker(_) | Error::NoPeers => ErrorKind::Tracker,
            Error::Peer(e) => peer_error_kind(e),
            Error::Download(DownloadError::Peer(e)) => peer_error_kind(e),
            Error::Download(DownloadError::PieceHashMismatch { .. }) => ErrorKind::Integrity,
            Error::Download(DownloadError::PieceOutOfRange { .. }) => ErrorKind::Metadata,
            Error::Download(DownloadError::Sink(_)) | Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the same request could succeed later or against another peer.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::FlowControl | ErrorKind::Integrity | ErrorKind::Transport)
    }

    /// Failures caused by one particular peer. Another peer may do better.
    pub fn is_peer_fault(&self) -> bool {
        self.is_retryable() || self.kind() == ErrorKind::Protocol
    }
}

fn peer_error_kind(e: &PeerError) -> ErrorKind {
    match e {
        PeerError::Io(_) | PeerError::Timeout(_) | PeerError::ConnectionClosed | PeerError::Closed => {
            ErrorKind::Transport
        },
        PeerError::Handshake(_) | PeerError::Message(_) | PeerError::InvalidBitfield { .. } => ErrorKind::Protocol,
        PeerError::Choked | PeerError::PeerLacksPiece { .. } | PeerError::ChokeRetriesExhausted(_) => {
            ErrorKind::FlowControl
        },
    }
}
