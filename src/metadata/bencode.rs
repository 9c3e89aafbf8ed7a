use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[cfg(test)]
mod tests;

/// Deepest list/dictionary nesting accepted before the input is rejected.
const MAX_DEPTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BencodeError {
    #[error("malformed byte string length at offset {pos}")]
    MalformedLength { pos: usize },
    #[error("malformed integer at offset {pos}")]
    MalformedInteger { pos: usize },
    #[error("input truncated at offset {pos}: {needed} more byte(s) required")]
    TruncatedInput { pos: usize, needed: usize },
    #[error("dictionary key at offset {pos} is not a byte string")]
    NonStringKey { pos: usize },
    #[error("invalid encoding at offset {pos}")]
    InvalidEncoding { pos: usize },
}

type Result<T> = std::result::Result<T, BencodeError>;

fn write_bytes(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02X}", byte)?;
    }
    Ok(())
}

fn write_byte_string(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(bytes) {
        Ok(s) if bytes.iter().all(|&byte| (0x20..=0x7e).contains(&byte)) => write!(f, "{}", s),
        _ => write_bytes(bytes, f),
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BencodeValue::Integer(num) => write!(f, "{}", num),
            BencodeValue::ByteString(bytes) => write_byte_string(bytes, f),
            BencodeValue::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            },
            BencodeValue::Dictionary(items) => {
                write!(f, "{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_byte_string(key, f)?;
                    write!(f, " => {}", value)?;
                }
                write!(f, "}}")
            },
        }
    }
}

/// Decodes one value starting at `start`, returning it together with the
/// number of bytes it occupied. Bytes after the value are left untouched.
pub fn decode(bytes: &[u8], start: usize) -> Result<(BencodeValue, usize)> {
    let mut parser = BencodeParser::new(bytes, start);
    let value = parser.parse_value(0)?;
    Ok((value, parser.pos - start))
}

/// Canonical encoding: dictionary keys come out in ascending byte order.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => {
            out.push(b'i');
            out.extend(i.to_string().as_bytes());
            out.push(b'e');
        },
        BencodeValue::ByteString(bytes) => encode_byte_string(bytes, out),
        BencodeValue::List(elements) => {
            out.push(b'l');
            for element in elements {
                encode_into(element, out);
            }
            out.push(b'e');
        },
        BencodeValue::Dictionary(items) => {
            out.push(b'd');
            for (key, value) in items {
                encode_byte_string(key, out);
                encode_into(value, out);
            }
            out.push(b'e');
        },
    }
}

fn encode_byte_string(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;

    /// Decodes a buffer holding exactly one value; trailing bytes are an error.
    fn try_from(bytes: &[u8]) -> Result<Self> {
        let (value, consumed) = decode(bytes, 0)?;
        if consumed != bytes.len() {
            return Err(BencodeError::InvalidEncoding { pos: consumed });
        }
        Ok(value)
    }
}

impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        encode(value)
    }
}

impl From<&BencodeValue> for serde_json::Value {
    fn from(value: &BencodeValue) -> serde_json::Value {
        match value {
            BencodeValue::Integer(i) => serde_json::Value::from(*i),
            BencodeValue::ByteString(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            },
            BencodeValue::List(elements) => {
                serde_json::Value::Array(elements.iter().map(serde_json::Value::from).collect())
            },
            BencodeValue::Dictionary(items) => {
                let map = items
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), serde_json::Value::from(v)))
                    .collect();
                serde_json::Value::Object(map)
            },
        }
    }
}

impl BencodeValue {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dictionary(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(elements) => Some(elements),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
}

impl<'a> BencodeParser<'a> {

    fn new(contents: &'a [u8], pos: usize) -> Self {
        Self { contents, pos }
    }

    fn parse_value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::InvalidEncoding { pos: self.pos });
        }
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(depth),
            b'd' => self.parse_dictionary(depth),
            b'0'..=b'9' => self.parse_string(),
            _ => Err(BencodeError::InvalidEncoding { pos: self.pos }),
        }
    }

    /// Consumes the run of ASCII digits at the cursor.
    fn take_digits(&mut self) -> &'a [u8] {
        let start = self.pos;
        while self.pos < self.contents.len() && self.contents[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        &self.contents[start..self.pos]
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let digits = self.take_digits();
        let malformed = BencodeError::MalformedInteger { pos: start };
        if digits.is_empty() {
            self.peek()?;
            return Err(malformed);
        }
        if digits[0] == b'0' && (digits.len() > 1 || negative) {
            return Err(malformed);
        }
        if self.peek()? != b'e' {
            return Err(malformed);
        }
        self.pos += 1;

        // Parse with the sign attached so i64::MIN is representable.
        let mut text = String::with_capacity(digits.len() + 1);
        if negative {
            text.push('-');
        }
        text.extend(digits.iter().map(|&d| d as char));
        let value = text.parse::<i64>().map_err(|_| malformed)?;
        Ok(BencodeValue::Integer(value))
    }

    fn parse_string(&mut self) -> Result<BencodeValue> {
        let bytes = self.parse_string_bytes()?;
        Ok(BencodeValue::ByteString(bytes.to_vec()))
    }

    fn parse_string_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let digits = self.take_digits();
        let malformed = BencodeError::MalformedLength { pos: start };
        if digits.is_empty() || (digits[0] == b'0' && digits.len() > 1) {
            return Err(malformed);
        }
        if self.peek()? != b':' {
            return Err(malformed);
        }
        self.pos += 1;
        let length = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(malformed)?;

        let available = self.contents.len() - self.pos;
        if length > available {
            return Err(BencodeError::TruncatedInput { pos: self.pos, needed: length - available });
        }
        let bytes = &self.contents[self.pos..self.pos + length];
        self.pos += length;
        Ok(bytes)
    }

    fn parse_list(&mut self, depth: usize) -> Result<BencodeValue> {
        self.pos += 1;
        let mut values: Vec<BencodeValue> = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.parse_value(depth + 1)?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self, depth: usize) -> Result<BencodeValue> {
        self.pos += 1;
        let mut map: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        loop {
            let key_pos = self.pos;
            match self.peek()? {
                b'e' => break,
                b'0'..=b'9' => (),
                _ => return Err(BencodeError::NonStringKey { pos: key_pos }),
            }
            // Out-of-order keys are accepted; the map re-sorts them on encode.
            let key = self.parse_string_bytes()?.to_vec();
            let value: BencodeValue = self.parse_value(depth + 1)?;
            if map.insert(key, value).is_some() {
                return Err(BencodeError::InvalidEncoding { pos: key_pos });
            }
        }
        self.pos += 1;
        Ok(BencodeValue::Dictionary(map))
    }

    fn peek(&self) -> Result<u8> {
        self.contents
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::TruncatedInput { pos: self.pos, needed: 1 })
    }
}
