use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use percent_encoding::{percent_decode_str, percent_encode, NON_ALPHANUMERIC};

use crate::metadata::bencode::BencodeValue;
use crate::metadata::file::{MetadataError, TorrentFile};
use crate::metadata::tracker::{announce_url, parse_compact_peers, TrackerError, TrackerResponse};
use crate::util::sha1::sha1_hash;

fn bytes(s: &str) -> BencodeValue {
    BencodeValue::ByteString(s.as_bytes().to_vec())
}

fn info_dict(length: i64, piece_length: i64, pieces: Vec<u8>) -> BTreeMap<Vec<u8>, BencodeValue> {
    let mut info = BTreeMap::new();
    info.insert(b"length".to_vec(), BencodeValue::Integer(length));
    info.insert(b"name".to_vec(), bytes("sample.txt"));
    info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
    info.insert(b"pieces".to_vec(), BencodeValue::ByteString(pieces));
    info
}

fn torrent(info: BTreeMap<Vec<u8>, BencodeValue>) -> BencodeValue {
    let mut top = BTreeMap::new();
    top.insert(b"announce".to_vec(), bytes("http://tracker.example:8080/announce"));
    top.insert(b"info".to_vec(), BencodeValue::Dictionary(info));
    BencodeValue::Dictionary(top)
}

#[test]
fn test_piece_geometry() {
    let file = TorrentFile::try_from(&torrent(info_dict(50_000, 32_768, vec![7; 40]))).unwrap();
    assert_eq!(file.num_pieces(), 2);
    assert_eq!(file.piece_length, 32_768);
    assert_eq!(file.last_piece_length(), 17_232);
    assert_eq!(file.piece_len(0), Some(32_768));
    assert_eq!(file.piece_len(1), Some(17_232));
    assert_eq!(file.piece_len(2), None);
    assert_eq!(file.piece_hash(1), Some(&[7u8; 20]));
}

#[test]
fn test_exact_multiple_has_full_last_piece() {
    let file = TorrentFile::try_from(&torrent(info_dict(65_536, 32_768, vec![0; 40]))).unwrap();
    assert_eq!(file.last_piece_length(), 32_768);
}

#[test]
fn test_info_hash_uses_canonical_encoding() {
    let info = info_dict(50_000, 32_768, vec![1; 40]);
    let expected = sha1_hash(&BencodeValue::Dictionary(info.clone()).encode());
    let file = TorrentFile::try_from(&torrent(info)).unwrap();
    assert_eq!(file.info_hash, expected);

    // Same info dictionary written with its keys out of order.
    let mut raw = b"d8:announce4:http4:infod4:name10:sample.txt6:lengthi50000e12:piece lengthi32768e6:pieces40:".to_vec();
    raw.extend([1u8; 40]);
    raw.extend(b"ee");
    let reordered = TorrentFile::from_bytes(&raw).unwrap();
    assert_eq!(reordered.info_hash, expected);
    assert_eq!(reordered.info_hash_hex(), hex::encode(expected));
}

#[test]
fn test_missing_fields() {
    for key in ["length", "name", "piece length", "pieces"] {
        let mut info = info_dict(50_000, 32_768, vec![0; 40]);
        info.remove(key.as_bytes());
        match TorrentFile::try_from(&torrent(info)) {
            Err(MetadataError::MissingField(name)) => assert_eq!(name, key),
            other => panic!("expected MissingField({key}), got {other:?}"),
        }
    }

    let mut top = BTreeMap::new();
    top.insert(b"info".to_vec(), BencodeValue::Dictionary(info_dict(1, 1, vec![0; 20])));
    assert!(matches!(
        TorrentFile::try_from(&BencodeValue::Dictionary(top)),
        Err(MetadataError::MissingField("announce"))
    ));

    let mut top = BTreeMap::new();
    top.insert(b"announce".to_vec(), bytes("http://a"));
    assert!(matches!(
        TorrentFile::try_from(&BencodeValue::Dictionary(top)),
        Err(MetadataError::MissingField("info"))
    ));
}

#[test]
fn test_corrupt_piece_table() {
    let result = TorrentFile::try_from(&torrent(info_dict(50_000, 32_768, vec![0; 41])));
    assert!(matches!(result, Err(MetadataError::CorruptPieceTable(41))));
}

#[test]
fn test_piece_count_must_match_length() {
    let result = TorrentFile::try_from(&torrent(info_dict(50_000, 32_768, vec![0; 60])));
    assert!(matches!(result, Err(MetadataError::PieceCountMismatch { expected: 2, found: 3 })));
}

#[test]
fn test_wrong_types() {
    assert!(matches!(TorrentFile::try_from(&BencodeValue::Integer(1)), Err(MetadataError::NotADictionary)));
    let result = TorrentFile::try_from(&torrent(info_dict(-1, 32_768, vec![0; 20])));
    assert!(matches!(result, Err(MetadataError::NegativeInteger("length"))));
    let result = TorrentFile::try_from(&torrent(info_dict(10, 0, vec![0; 20])));
    assert!(matches!(result, Err(MetadataError::InvalidPieceLength(0))));
}

#[test]
fn test_display_lists_piece_hashes() {
    let file = TorrentFile::try_from(&torrent(info_dict(50_000, 32_768, vec![0xAB; 40]))).unwrap();
    let text = file.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "Tracker URL: http://tracker.example:8080/announce");
    assert_eq!(lines[1], "Length: 50000");
    assert_eq!(lines[3], "Piece Length: 32768");
    assert_eq!(lines[4], "Piece Hashes:");
    assert_eq!(lines[5], "ab".repeat(20));
    assert_eq!(lines.len(), 7);
}

#[test]
fn test_compact_peers() {
    let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x00, 0x50]).unwrap();
    assert_eq!(peers, vec![
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
    ]);
    assert!(matches!(parse_compact_peers(&[1, 2, 3]), Err(TrackerError::IllegalPeersLength(3))));
}

#[test]
fn test_tracker_response() {
    let mut raw = b"d8:completei3e10:incompletei1e8:intervali1800e5:peers6:".to_vec();
    raw.extend([192, 168, 1, 9, 0x1A, 0xE1]);
    raw.push(b'e');
    let response = TrackerResponse::try_from(raw.as_slice()).unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.complete, Some(3));
    assert_eq!(response.incomplete, Some(1));
    assert_eq!(response.min_interval, None);
    assert_eq!(response.to_string(), "192.168.1.9:6881");
}

#[test]
fn test_tracker_failure_reason() {
    let result = TrackerResponse::try_from(&b"d14:failure reason7:unknowne"[..]);
    assert!(matches!(result, Err(TrackerError::Failure(reason)) if reason == "unknown"));
    let result = TrackerResponse::try_from(&b"d5:peers0:e"[..]);
    assert!(matches!(result, Err(TrackerError::MissingInterval)));
}

#[test]
fn test_announce_url() {
    let file = TorrentFile::try_from(&torrent(info_dict(50_000, 32_768, vec![0; 40]))).unwrap();
    let peer_id = *b"-TM0100-abcdefghijkl";
    let url = announce_url(&file, &peer_id, 6881).unwrap();
    let text = url.as_str();
    assert!(text.starts_with("http://tracker.example:8080/announce?port=6881&uploaded=0&downloaded=0&left=50000&compact=1"));
    // Alphanumeric bytes of the hash stay raw, everything else is escaped.
    let encoded = text.split("info_hash=").nth(1).unwrap().split('&').next().unwrap();
    let decoded: Vec<u8> = percent_decode_str(encoded).collect();
    assert_eq!(decoded, file.info_hash);
    assert_eq!(encoded, percent_encode(&file.info_hash, NON_ALPHANUMERIC).to_string());
    assert!(text.ends_with("peer_id=%2DTM0100%2Dabcdefghijkl"));
}
