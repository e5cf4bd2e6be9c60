//! Bencode codec
//!
//! Strict decoder and canonical encoder for the subset of bencode used by
//! the DHT: non-negative integers, byte strings, lists and dictionaries
//! with byte-string keys.

use crate::error::DhtError;
use bytes::BufMut;
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 32;

/// Bencode dictionary with keys kept in lexicographic order
pub type BencodeDict = BTreeMap<Vec<u8>, Value>;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BencodeDict),
}

impl Value {
    /// Byte-string value from anything byte-like
    pub fn bytes(data: impl AsRef<[u8]>) -> Self {
        Value::Bytes(data.as_ref().to_vec())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BencodeDict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

/// Encode a value canonically (dictionary keys in lexicographic order)
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Append the encoding of `value` to `buf`
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => encode_bytes_into(b, buf),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            encode_dict_entries_into(dict.iter(), buf);
            buf.put_u8(b'e');
        }
    }
}

/// Append a length-prefixed byte string to `buf`
pub fn encode_bytes_into(data: &[u8], buf: &mut Vec<u8>) {
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(data);
}

/// Append `key value` pairs without the surrounding `d`/`e`.
///
/// Callers must yield keys in lexicographic order.
pub fn encode_dict_entries_into<'a, I>(entries: I, buf: &mut Vec<u8>)
where
    I: IntoIterator<Item = (&'a Vec<u8>, &'a Value)>,
{
    for (key, value) in entries {
        encode_bytes_into(key, buf);
        encode_into(value, buf);
    }
}

/// Decode exactly one value spanning the whole input
pub fn decode(data: &[u8]) -> Result<Value, DhtError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != data.len() {
        return Err(DhtError::bencode_error("trailing data after value", decoder.pos));
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, DhtError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| DhtError::bencode_error("unexpected end of input", self.pos))
    }

    fn value(&mut self, depth: usize) -> Result<Value, DhtError> {
        if depth > MAX_DEPTH {
            return Err(DhtError::bencode_error("nesting too deep", self.pos));
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            c => Err(DhtError::bencode_error(format!("unexpected character {:?}", c as char), self.pos)),
        }
    }

    /// Digits up to `terminator`, rejecting empty input and leading zeros
    fn digits(&mut self, terminator: u8) -> Result<u64, DhtError> {
        let start = self.pos;
        while self.peek()? != terminator {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(DhtError::bencode_error("expected digit", self.pos));
            }
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        if digits.is_empty() {
            return Err(DhtError::bencode_error("empty number", start));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(DhtError::bencode_error("leading zero", start));
        }
        // Only ASCII digits were accepted above
        let text = std::str::from_utf8(digits).map_err(|_| DhtError::bencode_error("invalid number", start))?;
        let number = text
            .parse::<u64>()
            .map_err(|_| DhtError::bencode_error("number out of range", start))?;
        self.pos += 1;
        Ok(number)
    }

    fn integer(&mut self) -> Result<Value, DhtError> {
        self.pos += 1;
        let start = self.pos;
        let number = self.digits(b'e')?;
        let number = i64::try_from(number).map_err(|_| DhtError::bencode_error("integer out of range", start))?;
        Ok(Value::Integer(number))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, DhtError> {
        let start = self.pos;
        let len = self.digits(b':')? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| DhtError::bencode_error("byte string exceeds input", start))?;
        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, DhtError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, DhtError> {
        self.pos += 1;
        let mut dict = BencodeDict::new();
        let mut last_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(DhtError::bencode_error("dictionary key must be a byte string", key_pos));
            }
            let key = self.byte_string()?;
            if let Some(previous) = &last_key {
                if key <= *previous {
                    return Err(DhtError::bencode_error("dictionary keys out of order", key_pos));
                }
            }
            let value = self.value(depth + 1)?;
            last_key = Some(key.clone());
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
