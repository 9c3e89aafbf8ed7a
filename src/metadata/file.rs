use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::util::sha1::{sha1_hash, SHA1_LEN};

/// Metadata derived from a decoded `.torrent` dictionary. Immutable once built.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<u64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,

    pub name: String,
    pub total_length: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; SHA1_LEN]>,
    pub info_hash: [u8; SHA1_LEN],
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`pieces` length {0} is not a multiple of 20")]
    CorruptPieceTable(usize),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("field `{0}` must not be negative")]
    NegativeInteger(&'static str),
    #[error("piece length {0} is out of range")]
    InvalidPieceLength(u64),
    #[error("torrent length implies {expected} pieces but the piece table holds {found}")]
    PieceCountMismatch { expected: u64, found: usize },
    #[error("torrent file is not a bencoded dictionary")]
    NotADictionary,
    #[error("torrent file is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("unable to read torrent file: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, MetadataError>;

const ANNOUNCE: &[u8] = b"announce";
const ANNOUNCE_LIST: &[u8] = b"announce-list";
const CREATION_DATE: &[u8] = b"creation date";
const COMMENT: &[u8] = b"comment";
const CREATED_BY: &[u8] = b"created by";
const INFO: &[u8] = b"info";
const PIECE_LENGTH: &[u8] = b"piece length";
const PIECES: &[u8] = b"pieces";
const NAME: &[u8] = b"name";
const LENGTH: &[u8] = b"length";

type Dictionary = BTreeMap<Vec<u8>, BencodeValue>;

impl fmt::Display for TorrentFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Tracker URL: {}", self.announce)?;
        writeln!(f, "Length: {}", self.total_length)?;
        writeln!(f, "Info Hash: {}", self.info_hash_hex())?;
        writeln!(f, "Piece Length: {}", self.piece_length)?;
        write!(f, "Piece Hashes:")?;
        for hash in &self.piece_hashes {
            write!(f, "\n{}", hex::encode(hash))?;
        }
        Ok(())
    }
}

impl TryFrom<&BencodeValue> for TorrentFile {
    type Error = MetadataError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(MetadataError::NotADictionary)?;
        let info_value = items.get(INFO).ok_or(MetadataError::MissingField("info"))?;
        let info_items = info_value.as_dictionary().ok_or(MetadataError::WrongType("info"))?;
        TorrentFile::extract(items, info_value, info_items)
    }
}

impl TorrentFile {
    /// Reads and parses a `.torrent` file from disk.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read(path.as_ref())?;
        Self::from_bytes(&contents)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = BencodeValue::try_from(bytes)?;
        TorrentFile::try_from(&value)
    }

    fn extract(items: &Dictionary, info_value: &BencodeValue, info_items: &Dictionary) -> Result<Self> {
        let announce = Self::extract_string(items.get(ANNOUNCE), "announce")?
            .ok_or(MetadataError::MissingField("announce"))?;
        let announce_list = Self::extract_announce_list(items.get(ANNOUNCE_LIST))?;
        let creation_date = Self::extract_uint(items.get(CREATION_DATE), "creation date")?;
        let comment = Self::extract_string(items.get(COMMENT), "comment")?;
        let created_by = Self::extract_string(items.get(CREATED_BY), "created by")?;

        let total_length = Self::extract_uint(info_items.get(LENGTH), "length")?
            .ok_or(MetadataError::MissingField("length"))?;
        let name = Self::extract_string(info_items.get(NAME), "name")?
            .ok_or(MetadataError::MissingField("name"))?;
        let piece_length = Self::extract_uint(info_items.get(PIECE_LENGTH), "piece length")?
            .ok_or(MetadataError::MissingField("piece length"))?;
        let piece_hashes = Self::extract_pieces(info_items.get(PIECES))?;

        let piece_length = match u32::try_from(piece_length) {
            Ok(n) if n > 0 => n,
            _ => return Err(MetadataError::InvalidPieceLength(piece_length)),
        };
        let expected = total_length.div_ceil(piece_length as u64);
        if expected != piece_hashes.len() as u64 {
            return Err(MetadataError::PieceCountMismatch { expected, found: piece_hashes.len() });
        }

        // Hash the canonical re-encoding, not the bytes as they appeared on disk.
        let info_hash = sha1_hash(&info_value.encode());
        debug!(name = %name, info_hash = %hex::encode(info_hash), pieces = piece_hashes.len(), "parsed torrent metadata");

        Ok(TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            name,
            total_length,
            piece_length,
            piece_hashes,
            info_hash,
        })
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of the final piece, which may be shorter than `piece_length`.
    pub fn last_piece_length(&self) -> u32 {
        match self.total_length % self.piece_length as u64 {
            0 => self.piece_length,
            remainder => remainder as u32,
        }
    }

    pub fn piece_len(&self, index: u32) -> Option<u32> {
        let n = self.num_pieces();
        if index >= n {
            None
        } else if index == n - 1 {
            Some(self.last_piece_length())
        } else {
            Some(self.piece_length)
        }
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; SHA1_LEN]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    fn convert_string(value: &BencodeValue) -> Option<String> {
        value.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).map(str::to_owned).ok())
    }

    fn extract_string(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<String>> {
        match value {
            Some(v) => Self::convert_string(v).map(Some).ok_or(MetadataError::WrongType(name)),
            None => Ok(None),
        }
    }

    pub(crate) fn extract_uint(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<u64>> {
        match value {
            Some(v) => {
                let num = v.as_integer().ok_or(MetadataError::WrongType(name))?;
                u64::try_from(num).map(Some).map_err(|_| MetadataError::NegativeInteger(name))
            },
            None => Ok(None),
        }
    }

    fn extract_announce_list(value: Option<&BencodeValue>) -> Result<Vec<Vec<String>>> {
        let Some(v) = value else {
            return Ok(Vec::new());
        };
        let tiers = v.as_list().ok_or(MetadataError::WrongType("announce-list"))?;
        tiers
            .iter()
            .map(|tier| match tier {
                BencodeValue::List(urls) => urls
                    .iter()
                    .map(|url| Self::convert_string(url).ok_or(MetadataError::WrongType("announce-list")))
                    .collect(),
                _ => Self::convert_string(tier)
                    .map(|url| vec![url])
                    .ok_or(MetadataError::WrongType("announce-list")),
            })
            .collect()
    }

    fn extract_pieces(value: Option<&BencodeValue>) -> Result<Vec<[u8; SHA1_LEN]>> {
        let bytes = value
            .ok_or(MetadataError::MissingField("pieces"))?
            .as_bytes()
            .ok_or(MetadataError::WrongType("pieces"))?;
        if bytes.len() % SHA1_LEN != 0 {
            return Err(MetadataError::CorruptPieceTable(bytes.len()));
        }
        let hashes = bytes
            .chunks_exact(SHA1_LEN)
            .map(|chunk| {
                let mut hash = [0u8; SHA1_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        Ok(hashes)
    }
}
