use std::net::{SocketAddr, SocketAddrV4};
use std::path::Path;

use tracing::{info, warn};

pub mod config;
pub mod error;
pub mod metadata;
pub mod peer;
pub mod util;

pub use config::ClientConfig;
pub use error::{Error, ErrorKind};
pub use metadata::bencode::BencodeValue;
pub use metadata::file::TorrentFile;
pub use metadata::tracker::{HttpTracker, PeerSource, StaticPeers, TrackerResponse};
pub use peer::{Bitfield, Message, PeerConnection};
pub use util::io::{FileSink, MemorySink, PieceSink};

pub type Result<T> = std::result::Result<T, Error>;

/// Decodes one complete bencoded value into JSON.
pub fn decode_to_json(encoded: &[u8]) -> Result<serde_json::Value> {
    let value = BencodeValue::try_from(encoded)?;
    Ok(serde_json::Value::from(&value))
}

pub fn parse_torrent<P: AsRef<Path>>(path: P) -> Result<TorrentFile> {
    Ok(TorrentFile::from_path(path)?)
}

/// Announces to the torrent's tracker.
pub async fn retrieve_peers(torrent: &TorrentFile, config: &ClientConfig) -> Result<TrackerResponse> {
    let tracker = HttpTracker::new(config.port, config.tracker_timeout)?;
    Ok(tracker.announce(torrent, &config.peer_id).await?)
}

async fn connect(
    address: SocketAddr,
    torrent: &TorrentFile,
    config: &ClientConfig,
) -> std::result::Result<PeerConnection<tokio::net::TcpStream>, peer::PeerError> {
    PeerConnection::connect(
        address,
        torrent.info_hash,
        config.peer_id,
        torrent.piece_hashes.len(),
        config.peer.clone(),
    )
    .await
}

/// Handshakes with one peer and returns its peer id.
pub async fn handshake(torrent: &TorrentFile, address: SocketAddr, config: &ClientConfig) -> Result<[u8; 20]> {
    let mut conn = connect(address, torrent, config).await?;
    let peer_id = conn.remote_peer_id().copied().ok_or(peer::PeerError::Closed)?;
    conn.close().await;
    Ok(peer_id)
}

async fn piece_from_peer(
    address: SocketAddrV4,
    torrent: &TorrentFile,
    index: u32,
    config: &ClientConfig,
) -> Result<Vec<u8>> {
    let mut conn = connect(SocketAddr::V4(address), torrent, config).await?;
    let mut attempt = 0;
    let result = loop {
        match peer::download_piece(&mut conn, torrent, index).await {
            Err(peer::DownloadError::PieceHashMismatch { .. }) if attempt < config.peer.piece_retries => {
                attempt += 1;
                warn!(peer = %address, index, attempt, "hash mismatch, retrying piece");
            },
            other => break other,
        }
    };
    conn.close().await;
    Ok(result?)
}

/// Downloads one piece into `output`, trying each peer from `source` in turn.
/// Returns the peer that served it.
pub async fn download_piece(
    torrent: &TorrentFile,
    source: &dyn PeerSource,
    index: u32,
    output: &Path,
    config: &ClientConfig,
) -> Result<SocketAddrV4> {
    if index >= torrent.num_pieces() {
        return Err(peer::DownloadError::PieceOutOfRange { index, num_pieces: torrent.num_pieces() }.into());
    }
    let peers = source.fetch_peers(torrent, &config.peer_id).await?;
    let mut last_error = Error::NoPeers;
    for address in peers {
        match piece_from_peer(address, torrent, index, config).await {
            Ok(bytes) => {
                let mut sink = FileSink::create(output).await?;
                sink.append_piece(index, &bytes).await?;
                sink.finish().await?;
                info!(peer = %address, index, output = %output.display(), "piece written");
                return Ok(address);
            },
            Err(e) if e.is_peer_fault() => {
                warn!(peer = %address, index, error = %e, "peer failed, trying the next one");
                last_error = e;
            },
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}

async fn resume_from_peer(
    address: SocketAddrV4,
    torrent: &TorrentFile,
    next: &mut u32,
    sink: &mut dyn PieceSink,
    config: &ClientConfig,
) -> Result<()> {
    let mut conn = connect(SocketAddr::V4(address), torrent, config).await?;
    let result = peer::download_from(&mut conn, torrent, next, sink).await;
    conn.close().await;
    Ok(result?)
}

/// Downloads every piece in order into `sink`. When a peer fails the download
/// resumes at the first missing piece on the next peer.
pub async fn download(
    torrent: &TorrentFile,
    source: &dyn PeerSource,
    sink: &mut dyn PieceSink,
    config: &ClientConfig,
) -> Result<()> {
    let peers = source.fetch_peers(torrent, &config.peer_id).await?;
    let mut next = 0;
    let mut last_error = Error::NoPeers;
    for address in peers {
        match resume_from_peer(address, torrent, &mut next, sink, config).await {
            Ok(()) => {
                info!(name = %torrent.name, pieces = torrent.num_pieces(), "download complete");
                return Ok(());
            },
            Err(e) if e.is_peer_fault() => {
                warn!(peer = %address, next, error = %e, "peer failed, resuming on the next one");
                last_error = e;
            },
            Err(e) => {
                last_error = e;
                break;
            },
        }
    }
    // Keep the verified prefix that is still buffered in the sink.
    if let Err(e) = sink.finish().await {
        warn!(written = next, error = %e, "unable to flush partial download");
    }
    Err(last_error)
}
