//! A small bencode codec: the recursive `{ integer, byte-string, list,
//! dictionary }` data model used by every message on the wire (§4.2).
//!
//! Dictionary keys are preserved in insertion order on emit, matching the
//! requirement that re-encoding a decoded value reproduces the original
//! byte sequence (§8, scenario 1).

use crate::error::DhtError;
use std::fmt;

/// A decoded (or to-be-encoded) bencode value.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs. A `Vec` rather than a `BTreeMap`
    /// because bencode dictionaries are conventionally key-sorted by
    /// producers but this codec does not require it, and preserving
    /// insertion order is what makes round-tripping exact.
    Dict(Vec<(Vec<u8>, Value)>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Bytes(b) => write!(f, "Bytes({})", hex::encode(b)),
            Value::List(l) => f.debug_list().entries(l.iter()).finish(),
            Value::Dict(d) => f
                .debug_map()
                .entries(d.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
                .finish(),
        }
    }
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key in a `Dict` value. Returns `None` for non-dict values
    /// or a missing key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k == key.as_bytes())
            .map(|(_, v)| v)
    }

    /// Appends bencoded bytes for this value into `out`. Errors only if
    /// `out` cannot hold the result (`out` is a fixed-capacity scratch
    /// buffer in the node core, §4.7).
    pub fn encode_into(&self, out: &mut Vec<u8>, max_len: usize) -> Result<(), DhtError> {
        match self {
            Value::Int(i) => {
                push_checked(out, format!("i{}e", i).as_bytes(), max_len)?;
            }
            Value::Bytes(b) => {
                push_checked(out, format!("{}:", b.len()).as_bytes(), max_len)?;
                push_checked(out, b, max_len)?;
            }
            Value::List(items) => {
                push_checked(out, b"l", max_len)?;
                for item in items {
                    item.encode_into(out, max_len)?;
                }
                push_checked(out, b"e", max_len)?;
            }
            Value::Dict(entries) => {
                push_checked(out, b"d", max_len)?;
                for (k, v) in entries {
                    push_checked(out, format!("{}:", k.len()).as_bytes(), max_len)?;
                    push_checked(out, k, max_len)?;
                    v.encode_into(out, max_len)?;
                }
                push_checked(out, b"e", max_len)?;
            }
        }
        Ok(())
    }

    /// Encodes into a freshly allocated buffer capped at `max_len` bytes.
    pub fn encode(&self, max_len: usize) -> Result<Vec<u8>, DhtError> {
        let mut out = Vec::new();
        self.encode_into(&mut out, max_len)?;
        Ok(out)
    }

    /// Decodes a single bencoded value from the front of `input`, returning
    /// the value and the number of bytes consumed.
    pub fn decode(input: &[u8]) -> Result<(Value, usize), DhtError> {
        let mut pos = 0;
        let value = decode_value(input, &mut pos)?;
        Ok((value, pos))
    }
}

fn push_checked(out: &mut Vec<u8>, bytes: &[u8], max_len: usize) -> Result<(), DhtError> {
    if out.len() + bytes.len() > max_len {
        return Err(DhtError::BufferTooSmall);
    }
    out.extend_from_slice(bytes);
    Ok(())
}

fn decode_value(input: &[u8], pos: &mut usize) -> Result<Value, DhtError> {
    match input.get(*pos) {
        Some(b'i') => decode_int(input, pos),
        Some(b'l') => decode_list(input, pos),
        Some(b'd') => decode_dict(input, pos),
        Some(c) if c.is_ascii_digit() => decode_bytes(input, pos),
        _ => Err(DhtError::InvalidBencode),
    }
}

fn decode_int(input: &[u8], pos: &mut usize) -> Result<Value, DhtError> {
    debug_assert_eq!(input.get(*pos), Some(&b'i'));
    *pos += 1;
    let start = *pos;
    if input.get(*pos) == Some(&b'-') {
        *pos += 1;
    }
    let digits_start = *pos;
    while input.get(*pos).map_or(false, |b| b.is_ascii_digit()) {
        *pos += 1;
    }
    if *pos == digits_start {
        return Err(DhtError::InvalidBencode);
    }
    if input.get(*pos) != Some(&b'e') {
        return Err(DhtError::InvalidBencode);
    }
    let text = std::str::from_utf8(&input[start..*pos]).map_err(|_| DhtError::InvalidBencode)?;
    let value = text.parse::<i64>().map_err(|_| DhtError::InvalidBencode)?;
    *pos += 1; // consume 'e'
    Ok(Value::Int(value))
}

fn decode_bytes(input: &[u8], pos: &mut usize) -> Result<Value, DhtError> {
    let digits_start = *pos;
    while input.get(*pos).map_or(false, |b| b.is_ascii_digit()) {
        *pos += 1;
    }
    if *pos == digits_start {
        return Err(DhtError::InvalidBencode);
    }
    if input.get(*pos) != Some(&b':') {
        return Err(DhtError::InvalidBencode);
    }
    let len_text =
        std::str::from_utf8(&input[digits_start..*pos]).map_err(|_| DhtError::InvalidBencode)?;
    let len: usize = len_text.parse().map_err(|_| DhtError::InvalidBencode)?;
    *pos += 1; // consume ':'
    let end = pos.checked_add(len).ok_or(DhtError::InvalidBencode)?;
    let bytes = input.get(*pos..end).ok_or(DhtError::InvalidBencode)?;
    *pos = end;
    Ok(Value::Bytes(bytes.to_vec()))
}

fn decode_list(input: &[u8], pos: &mut usize) -> Result<Value, DhtError> {
    debug_assert_eq!(input.get(*pos), Some(&b'l'));
    *pos += 1;
    let mut items = Vec::new();
    loop {
        match input.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::List(items));
            }
            Some(_) => items.push(decode_value(input, pos)?),
            None => return Err(DhtError::InvalidBencode),
        }
    }
}

fn decode_dict(input: &[u8], pos: &mut usize) -> Result<Value, DhtError> {
    debug_assert_eq!(input.get(*pos), Some(&b'd'));
    *pos += 1;
    let mut entries = Vec::new();
    loop {
        match input.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::Dict(entries));
            }
            Some(c) if c.is_ascii_digit() => {
                let key = match decode_bytes(input, pos)? {
                    Value::Bytes(b) => b,
                    _ => unreachable!(),
                };
                let value = decode_value(input, pos)?;
                entries.push((key, value));
            }
            _ => return Err(DhtError::InvalidBencode),
        }
    }
}

/// Convenience builder for a `Dict` value out of `(&str, Value)` pairs,
/// preserving the order given.
pub fn dict(entries: Vec<(&str, Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 10 * 1024;

    #[test]
    fn round_trip_int() {
        let v = Value::Int(-42);
        let bytes = v.encode(MAX).unwrap();
        assert_eq!(bytes, b"i-42e");
        let (decoded, consumed) = Value::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, v);
    }

    #[test]
    fn round_trip_bytes() {
        let v = Value::bytes(b"spam".to_vec());
        let bytes = v.encode(MAX).unwrap();
        assert_eq!(bytes, b"4:spam");
        let (decoded, _) = Value::decode(&bytes).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn round_trip_list() {
        let v = Value::List(vec![Value::bytes(b"spam".to_vec()), Value::Int(7)]);
        let bytes = v.encode(MAX).unwrap();
        assert_eq!(bytes, b"l4:spami7ee");
        let (decoded, _) = Value::decode(&bytes).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn round_trip_dict_preserves_order() {
        let v = dict(vec![
            ("b", Value::Int(2)),
            ("a", Value::Int(1)),
        ]);
        let bytes = v.encode(MAX).unwrap();
        assert_eq!(bytes, b"d1:bi2e1:ai1ee");
        let (decoded, _) = Value::decode(&bytes).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn decode_rejects_unterminated_container() {
        assert!(Value::decode(b"l4:spam").is_err());
        assert!(Value::decode(b"d1:ai1e").is_err());
    }

    #[test]
    fn decode_rejects_non_digit_length_prefix() {
        assert!(Value::decode(b"x:spam").is_err());
    }

    #[test]
    fn encode_fails_when_buffer_too_small() {
        let v = Value::bytes(vec![0u8; 100]);
        assert!(matches!(v.encode(10), Err(DhtError::BufferTooSmall)));
    }

    #[test]
    fn find_node_round_trip_matches_scenario_1() {
        let id = Value::bytes(vec![0x01u8; 20]);
        let target = Value::bytes(vec![0x02u8; 20]);
        let msg = dict(vec![
            (
                "a",
                dict(vec![("id", id), ("target", target)]),
            ),
            ("q", Value::bytes(b"find_node".to_vec())),
            ("t", Value::bytes(b"aa".to_vec())),
            ("y", Value::bytes(b"q".to_vec())),
        ]);
        let bytes = msg.encode(MAX).unwrap();
        let expected = format!(
            "d1:ad2:id20:{}6:target20:{}e1:q9:find_node1:t2:aa1:y1:qe",
            "\u{1}".repeat(20),
            "\u{2}".repeat(20)
        );
        assert_eq!(bytes, expected.into_bytes());
        let (decoded, consumed) = Value::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, msg);
    }
}
