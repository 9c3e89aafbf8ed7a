use core::fmt;
use std::net::SocketAddrV4;
use std::result::Result;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::metadata::file::{MetadataError, TorrentFile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("announce url `{0}` is invalid")]
    InvalidAnnounceUrl(String),
    #[error("tracker response is invalid bencode data: {0}")]
    NonBencodedTrackerResponse(BencodeError),
    #[error("tracker response is not a bencoded dictionary")]
    TrackerResponseNotADictionary,
    #[error("tracker refused the announce: {0}")]
    Failure(String),
    #[error("peers list byte length ({0}) is not a multiple of 6")]
    IllegalPeersLength(usize),
    #[error("tracker response missing interval key")]
    MissingInterval,
    #[error("tracker response field malformed: {0}")]
    MalformedField(MetadataError),
    #[error("tracker response missing peers key")]
    MissingPeers,
    #[error("tracker response peers list is not a byte string")]
    MalformedPeersList,
    #[error("no response received from tracker: {0}")]
    NoTrackerResponse(reqwest::Error),
    #[error("tracker response contains no body: {0}")]
    NoTrackerResponseBody(reqwest::Error),
}

const INTERVAL: &[u8] = b"interval";
const MIN_INTERVAL: &[u8] = b"min interval";
const COMPLETE: &[u8] = b"complete";
const INCOMPLETE: &[u8] = b"incomplete";
const PEERS: &[u8] = b"peers";
const FAILURE_REASON: &[u8] = b"failure reason";

const COMPACT_PEER_LEN: usize = 6;

/// Unpacks the compact peer list: 4 bytes of IPv4 address then a big-endian port.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(TrackerError::IllegalPeersLength(bytes.len()));
    }
    let peers = bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip.into(), port)
        })
        .collect();
    Ok(peers)
}

fn extract_uint(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<u64>, TrackerError> {
    TorrentFile::extract_uint(value, name).map_err(TrackerError::MalformedField)
}

impl TryFrom<&BencodeValue> for TrackerResponse {
    type Error = TrackerError;

    fn try_from(value: &BencodeValue) -> Result<Self, TrackerError> {
        let items = value.as_dictionary().ok_or(TrackerError::TrackerResponseNotADictionary)?;
        if let Some(reason) = items.get(FAILURE_REASON) {
            let reason = reason
                .as_bytes()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_else(|| reason.to_string());
            return Err(TrackerError::Failure(reason));
        }
        let interval = extract_uint(items.get(INTERVAL), "interval")?.ok_or(TrackerError::MissingInterval)?;
        let peers = match items.get(PEERS) {
            Some(BencodeValue::ByteString(bytes)) => parse_compact_peers(bytes)?,
            Some(_) => return Err(TrackerError::MalformedPeersList),
            None => return Err(TrackerError::MissingPeers),
        };
        Ok(TrackerResponse {
            interval,
            min_interval: extract_uint(items.get(MIN_INTERVAL), "min interval")?,
            complete: extract_uint(items.get(COMPLETE), "complete")?,
            incomplete: extract_uint(items.get(INCOMPLETE), "incomplete")?,
            peers,
        })
    }
}

impl TryFrom<&[u8]> for TrackerResponse {
    type Error = TrackerError;

    fn try_from(bytes: &[u8]) -> Result<Self, TrackerError> {
        let bencoded_response = BencodeValue::try_from(bytes)
            .map_err(TrackerError::NonBencodedTrackerResponse)?;
        TrackerResponse::try_from(&bencoded_response)
    }
}

impl fmt::Display for TrackerResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, socket) in self.peers.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{socket}")?;
        }
        Ok(())
    }
}

/// Builds the announce GET url. `info_hash` and `peer_id` are raw bytes and
/// are percent-encoded by hand since `Url` would re-encode them as UTF-8.
pub fn announce_url(file: &TorrentFile, peer_id: &[u8; 20], port: u16) -> Result<Url, TrackerError> {
    let mut url = Url::parse(&file.announce)
        .map_err(|_| TrackerError::InvalidAnnounceUrl(file.announce.to_string()))?;

    url.query_pairs_mut()
        .append_pair("port", &port.to_string())
        .append_pair("uploaded", "0")
        .append_pair("downloaded", "0")
        .append_pair("left", &file.total_length.to_string())
        .append_pair("compact", "1");

    let encoded_hash = percent_encode(&file.info_hash, NON_ALPHANUMERIC).to_string();
    let encoded_id = percent_encode(peer_id, NON_ALPHANUMERIC).to_string();
    let new_url_str = format!("{}&info_hash={}&peer_id={}", url, encoded_hash, encoded_id);
    Url::parse(&new_url_str).map_err(|_| TrackerError::InvalidAnnounceUrl(new_url_str))
}

/// Anything that can hand back a list of peers for a torrent.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn fetch_peers(&self, file: &TorrentFile, peer_id: &[u8; 20]) -> Result<Vec<SocketAddrV4>, TrackerError>;
}

/// Announces to the torrent's HTTP tracker.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: reqwest::Client,
    port: u16,
}

impl HttpTracker {
    pub fn new(port: u16, timeout: Duration) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TrackerError::NoTrackerResponse)?;
        Ok(HttpTracker { client, port })
    }

    pub async fn announce(&self, file: &TorrentFile, peer_id: &[u8; 20]) -> Result<TrackerResponse, TrackerError> {
        let url = announce_url(file, peer_id, self.port)?;
        debug!(%url, "announcing to tracker");

        let response = self.client.get(url).send().await.map_err(TrackerError::NoTrackerResponse)?;
        let response_bytes = response.bytes().await.map_err(TrackerError::NoTrackerResponseBody)?;
        let tracker_response = TrackerResponse::try_from(response_bytes.as_ref())?;

        info!(peers = tracker_response.peers.len(), interval = tracker_response.interval, "tracker responded");
        Ok(tracker_response)
    }
}

#[async_trait]
impl PeerSource for HttpTracker {
    async fn fetch_peers(&self, file: &TorrentFile, peer_id: &[u8; 20]) -> Result<Vec<SocketAddrV4>, TrackerError> {
        Ok(self.announce(file, peer_id).await?.peers)
    }
}

/// A fixed peer list, e.g. an address given on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers(pub Vec<SocketAddrV4>);

#[async_trait]
impl PeerSource for StaticPeers {
    async fn fetch_peers(&self, _file: &TorrentFile, _peer_id: &[u8; 20]) -> Result<Vec<SocketAddrV4>, TrackerError> {
        Ok(self.0.clone())
    }
}
