use std::collections::BTreeMap;

use super::*;

fn bytes(s: &str) -> BencodeValue {
    BencodeValue::ByteString(s.as_bytes().to_vec())
}

fn dict(pairs: &[(&str, BencodeValue)]) -> BencodeValue {
    let map: BTreeMap<Vec<u8>, BencodeValue> = pairs
        .iter()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
        .collect();
    BencodeValue::Dictionary(map)
}

#[test]
fn test_decode_byte_string() {
    assert_eq!(decode(b"4:spam", 0).unwrap(), (bytes("spam"), 6));
    assert_eq!(decode(b"0:", 0).unwrap(), (bytes(""), 2));
}

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i-42e", 0).unwrap(), (BencodeValue::Integer(-42), 5));
    assert_eq!(decode(b"i0e", 0).unwrap(), (BencodeValue::Integer(0), 3));
    assert_eq!(
        decode(b"i-9223372036854775808e", 0).unwrap().0,
        BencodeValue::Integer(i64::MIN)
    );
}

#[test]
fn test_decode_list() {
    let (value, consumed) = decode(b"l4:spam4:eggse", 0).unwrap();
    assert_eq!(value, BencodeValue::List(vec![bytes("spam"), bytes("eggs")]));
    assert_eq!(consumed, 14);
    assert_eq!(decode(b"le", 0).unwrap(), (BencodeValue::List(vec![]), 2));
}

#[test]
fn test_decode_list_keeps_every_element() {
    // Nested containers closing back to back must not cut the outer list short.
    let input = b"l4:spamli1ei2eeli3eed1:ai4eee";
    let (value, consumed) = decode(input, 0).unwrap();
    assert_eq!(consumed, input.len());
    assert_eq!(
        value,
        BencodeValue::List(vec![
            bytes("spam"),
            BencodeValue::List(vec![BencodeValue::Integer(1), BencodeValue::Integer(2)]),
            BencodeValue::List(vec![BencodeValue::Integer(3)]),
            dict(&[("a", BencodeValue::Integer(4))]),
        ])
    );
}

#[test]
fn test_decode_dictionary() {
    let (value, consumed) = decode(b"d3:cow3:moo4:spam4:eggse", 0).unwrap();
    assert_eq!(consumed, 24);
    assert_eq!(value, dict(&[("cow", bytes("moo")), ("spam", bytes("eggs"))]));
    assert_eq!(value.encode(), b"d3:cow3:moo4:spam4:eggse");
}

#[test]
fn test_decode_from_offset_reports_consumed() {
    let input = b"i1e4:spamxyz";
    let (first, n) = decode(input, 0).unwrap();
    assert_eq!((first, n), (BencodeValue::Integer(1), 3));
    let (second, m) = decode(input, n).unwrap();
    assert_eq!((second, m), (bytes("spam"), 6));
}

#[test]
fn test_out_of_order_keys_are_sorted_on_encode() {
    let value = BencodeValue::try_from(&b"d4:spam4:eggs3:cow3:mooe"[..]).unwrap();
    assert_eq!(value.encode(), b"d3:cow3:moo4:spam4:eggse");
}

#[test]
fn test_truncated_input() {
    assert!(matches!(decode(b"10:abc", 0), Err(BencodeError::TruncatedInput { .. })));
    assert!(matches!(decode(b"l4:spam", 0), Err(BencodeError::TruncatedInput { .. })));
    assert!(matches!(decode(b"i42", 0), Err(BencodeError::TruncatedInput { .. })));
    assert!(matches!(decode(b"", 0), Err(BencodeError::TruncatedInput { .. })));
}

#[test]
fn test_malformed_integer() {
    assert_eq!(decode(b"i03e", 0), Err(BencodeError::MalformedInteger { pos: 0 }));
    assert_eq!(decode(b"i-0e", 0), Err(BencodeError::MalformedInteger { pos: 0 }));
    assert_eq!(decode(b"ie", 0), Err(BencodeError::MalformedInteger { pos: 0 }));
    assert_eq!(decode(b"i1x2e", 0), Err(BencodeError::MalformedInteger { pos: 0 }));
    assert_eq!(
        decode(b"i99999999999999999999e", 0),
        Err(BencodeError::MalformedInteger { pos: 0 })
    );
}

#[test]
fn test_malformed_length() {
    assert_eq!(decode(b"04:spam", 0), Err(BencodeError::MalformedLength { pos: 0 }));
    assert_eq!(decode(b"4spam", 0), Err(BencodeError::MalformedLength { pos: 0 }));
}

#[test]
fn test_non_string_key() {
    assert_eq!(decode(b"di1e3:mooe", 0), Err(BencodeError::NonStringKey { pos: 1 }));
    assert_eq!(decode(b"dle3:mooe", 0), Err(BencodeError::NonStringKey { pos: 1 }));
    assert_eq!(decode(b"d:e", 0), Err(BencodeError::NonStringKey { pos: 1 }));
}

#[test]
fn test_invalid_encoding() {
    assert_eq!(decode(b"x", 0), Err(BencodeError::InvalidEncoding { pos: 0 }));
    assert_eq!(
        BencodeValue::try_from(&b"i1ei2e"[..]),
        Err(BencodeError::InvalidEncoding { pos: 3 })
    );
    assert_eq!(
        BencodeValue::try_from(&b"d1:ai1e1:ai2ee"[..]),
        Err(BencodeError::InvalidEncoding { pos: 7 })
    );
}

#[test]
fn test_nesting_limit() {
    let mut input = vec![b'l'; MAX_DEPTH + 2];
    input.extend(vec![b'e'; MAX_DEPTH + 2]);
    assert!(matches!(decode(&input, 0), Err(BencodeError::InvalidEncoding { .. })));
}

#[test]
fn test_round_trip_value() {
    let value = dict(&[
        ("announce", bytes("http://tracker.example/announce")),
        ("info", dict(&[
            ("length", BencodeValue::Integer(50_000)),
            ("name", bytes("sample.txt")),
            ("piece length", BencodeValue::Integer(32_768)),
            ("pieces", BencodeValue::ByteString(vec![0xAB; 40])),
        ])),
        ("list", BencodeValue::List(vec![BencodeValue::Integer(-7), bytes(""), BencodeValue::List(vec![])])),
    ]);
    let encoded = encode(&value);
    assert_eq!(BencodeValue::try_from(encoded.as_slice()).unwrap(), value);
}

#[test]
fn test_round_trip_canonical_bytes() {
    let inputs: [&[u8]; 5] = [
        b"i-42e",
        b"5:hello",
        b"l5:helloi52ee",
        b"d10:inner_dictd4:key16:value14:key2i42e8:list_keyl5:item15:item2i3eeee",
        b"d3:bar4:spam3:fooi42ee",
    ];
    for input in inputs {
        let value = BencodeValue::try_from(input).unwrap();
        assert_eq!(encode(&value), input);
    }
}

#[test]
fn test_json_conversion() {
    let value = BencodeValue::try_from(&b"d3:fool5:helloi52ee3:numi-1ee"[..]).unwrap();
    let json = serde_json::Value::from(&value);
    assert_eq!(json.to_string(), r#"{"foo":["hello",52],"num":-1}"#);
}

#[test]
fn test_display() {
    let value = BencodeValue::try_from(&b"d1:al1:bi1eee"[..]).unwrap();
    assert_eq!(value.to_string(), "{a => [b, 1]}");
    assert_eq!(BencodeValue::ByteString(vec![0x00, 0xFF]).to_string(), "00FF");
}
