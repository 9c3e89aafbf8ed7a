use std::result::Result;

use thiserror::Error;

pub const HANDSHAKE_LEN: usize = 68;

const P_STR: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake must be 68 bytes, got {0}")]
    InvalidHandshakeLength(usize),
    #[error("protocol identifier length must be 19, got {0}")]
    InvalidProtocolIdLength(u8),
    #[error("unknown protocol identifier {0:?}")]
    InvalidProtocolId([u8; 19]),
    #[error("peer answered for info hash {} instead of {}", hex::encode(.received), hex::encode(.expected))]
    HandshakeMismatch { expected: [u8; 20], received: [u8; 20] },
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { reserved: [0; 8], info_hash, peer_id }
    }

    /// Checks a reply against the handshake we sent.
    pub fn verify_reply(&self, reply: &Handshake) -> Result<(), HandshakeError> {
        if self.info_hash != reply.info_hash {
            return Err(HandshakeError::HandshakeMismatch { expected: self.info_hash, received: reply.info_hash });
        }
        Ok(())
    }
}

impl TryFrom<&[u8]> for Handshake {
    type Error = HandshakeError;

    fn try_from(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::InvalidHandshakeLength(bytes.len()));
        };
        if bytes[0] != 19 {
            return Err(HandshakeError::InvalidProtocolIdLength(bytes[0]));
        };
        if bytes[1..20] != *P_STR {
            let mut p_str = [0u8; 19];
            p_str.copy_from_slice(&bytes[1..20]);
            return Err(HandshakeError::InvalidProtocolId(p_str));
        }
        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&bytes[20..28]);
        handshake.info_hash.copy_from_slice(&bytes[28..48]);
        handshake.peer_id.copy_from_slice(&bytes[48..68]);
        Ok(handshake)
    }
}

impl From<&Handshake> for [u8; HANDSHAKE_LEN] {
    fn from(handshake: &Handshake) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = 0x13;
        bytes[1..20].copy_from_slice(P_STR);
        bytes[20..28].copy_from_slice(&handshake.reserved);
        bytes[28..48].copy_from_slice(&handshake.info_hash);
        bytes[48..68].copy_from_slice(&handshake.peer_id);
        bytes
    }
}
