use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::peer::PeerConfig;

pub const PEER_ID_PREFIX: &[u8; 8] = b"-TM0100-";
pub const DEFAULT_PORT: u16 = 6881;

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_id: [u8; 20],
    /// Port reported to the tracker. Nothing listens on it.
    pub port: u16,
    pub tracker_timeout: Duration,
    pub peer: PeerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            peer_id: generate_peer_id(),
            port: DEFAULT_PORT,
            tracker_timeout: Duration::from_secs(10),
            peer: PeerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Applies one timeout to connecting, the tracker request and peer silence.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.tracker_timeout = timeout;
        self.peer.connect_timeout = timeout;
        self.peer.idle_timeout = timeout;
        self
    }
}

/// `-TM0100-` followed by twelve random alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    for (slot, byte) in peer_id[8..].iter_mut().zip(rand::thread_rng().sample_iter(&Alphanumeric)) {
        *slot = byte;
    }
    peer_id
}

/// Accepts exactly 20 ASCII characters or 40 hex digits.
pub fn parse_peer_id(s: &str) -> Result<[u8; 20], String> {
    let mut peer_id = [0u8; 20];
    if s.len() == 20 {
        peer_id.copy_from_slice(s.as_bytes());
        return Ok(peer_id);
    }
    if s.len() == 40 {
        return hex::decode_to_slice(s, &mut peer_id)
            .map(|_| peer_id)
            .map_err(|e| format!("invalid hex peer id: {e}"));
    }
    Err(format!("peer id must be 20 bytes or 40 hex digits, got {} characters", s.len()))
}
