//! Binary envelope codec
//!
//! Two building blocks shared by every layer that has to put more than one
//! logical value into a single binary message:
//!
//! - [`Value`] with [`encode`]/[`decode`]: a one-byte type tag followed by the
//!   raw bytes or the JSON text of the value.
//! - [`pack`]/[`unpack`]: a length-prefixed list of byte buffers.
//!   `u16 metadata length | u32 length * N | bodies`, all big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const TAG_BYTES: u8 = 0;
const TAG_OBJECT: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_BOOLEAN: u8 = 4;

const PART_LENGTH_SIZE: usize = 4;
const METADATA_INDICATOR_SIZE: usize = 2;

/// A value that can travel through the envelope codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Bytes),
    /// Any JSON-serializable structure
    Object(serde_json::Value),
    String(String),
    Number(f64),
    Boolean(bool),
}

impl Value {
    /// Encode any serializable structure as an object value.
    pub fn object<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Value::Object(serde_json::to_value(value)?))
    }

    /// Decode an object value into `T`.
    pub fn into_object<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        match self {
            Value::Object(v) => Ok(serde_json::from_value(v)?),
            other => Err(Error::protocol(format!(
                "expected an object value, got {}",
                other.kind()
            ))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Bytes(_) => TAG_BYTES,
            Value::Object(_) => TAG_OBJECT,
            Value::String(_) => TAG_STRING,
            Value::Number(_) => TAG_NUMBER,
            Value::Boolean(_) => TAG_BOOLEAN,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "bytes",
            Value::Object(_) => "object",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Encode a value as `tag | body`.
///
/// Non-finite numbers have no JSON form and are rejected.
pub fn encode(value: &Value) -> Result<Bytes> {
    let body = match value {
        Value::Bytes(b) => b.to_vec(),
        Value::Object(v) => serde_json::to_vec(v)?,
        Value::String(s) => serde_json::to_vec(s)?,
        Value::Number(n) if !n.is_finite() => {
            return Err(Error::protocol(format!("number {} has no JSON form", n)))
        }
        Value::Number(n) => serde_json::to_vec(n)?,
        Value::Boolean(b) => serde_json::to_vec(b)?,
    };

    let mut out = BytesMut::with_capacity(body.len() + 1);
    out.put_u8(value.tag());
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Decode a `tag | body` buffer produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<Value> {
    let (&tag, body) = data
        .split_first()
        .ok_or_else(|| Error::malformed("empty tagged value"))?;

    let value = match tag {
        TAG_BYTES => Value::Bytes(Bytes::copy_from_slice(body)),
        TAG_OBJECT => Value::Object(serde_json::from_slice(body)?),
        TAG_STRING => Value::String(serde_json::from_slice(body)?),
        TAG_NUMBER => Value::Number(serde_json::from_slice(body)?),
        TAG_BOOLEAN => Value::Boolean(serde_json::from_slice(body)?),
        other => return Err(Error::UnknownDataType(other)),
    };
    Ok(value)
}

/// Join byte buffers into one length-prefixed message.
pub fn pack<B: AsRef<[u8]>>(parts: &[B]) -> Result<Bytes> {
    let metadata_len = parts.len() * PART_LENGTH_SIZE;
    let metadata_len = u16::try_from(metadata_len)
        .map_err(|_| Error::protocol(format!("too many parts to pack: {}", parts.len())))?;

    let body_len: usize = parts.iter().map(|p| p.as_ref().len()).sum();
    let mut out =
        BytesMut::with_capacity(METADATA_INDICATOR_SIZE + metadata_len as usize + body_len);

    out.put_u16(metadata_len);
    for part in parts {
        let len = u32::try_from(part.as_ref().len())
            .map_err(|_| Error::protocol("part exceeds 4 GiB"))?;
        out.put_u32(len);
    }
    for part in parts {
        out.put_slice(part.as_ref());
    }
    Ok(out.freeze())
}

/// Split a message produced by [`pack`] back into its parts.
///
/// Parts are zero-copy slices of `data`.
pub fn unpack(data: &Bytes) -> Result<Vec<Bytes>> {
    let mut cursor = data.as_ref();
    if cursor.remaining() < METADATA_INDICATOR_SIZE {
        return Err(Error::malformed("missing envelope metadata length"));
    }
    let metadata_len = cursor.get_u16() as usize;
    if metadata_len % PART_LENGTH_SIZE != 0 || cursor.remaining() < metadata_len {
        return Err(Error::malformed(format!(
            "invalid envelope metadata length {}",
            metadata_len
        )));
    }

    let count = metadata_len / PART_LENGTH_SIZE;
    let lengths: Vec<usize> = (0..count).map(|_| cursor.get_u32() as usize).collect();

    let mut offset = METADATA_INDICATOR_SIZE + metadata_len;
    let mut parts = Vec::with_capacity(count);
    for len in lengths {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| Error::malformed("envelope part exceeds message length"))?;
        parts.push(data.slice(offset..end));
        offset = end;
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_roundtrip_all_kinds() {
        let values = vec![
            Value::Bytes(Bytes::from_static(&[0, 1, 2, 255])),
            Value::Bytes(Bytes::new()),
            Value::Object(json!({"test": "object", "nested": [1, 2, {"k": null}]})),
            Value::String("String".to_string()),
            Value::String(String::new()),
            Value::Number(42.0),
            Value::Number(-0.125),
            Value::Boolean(false),
            Value::Boolean(true),
        ];

        for value in values {
            let encoded = encode(&value).unwrap();
            assert_eq!(decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_tag_layout() {
        assert_eq!(encode(&Value::Bytes(Bytes::from_static(b"ab"))).unwrap()[..], [0, b'a', b'b']);
        assert_eq!(encode(&Value::from("hi")).unwrap()[..], *b"\x02\"hi\"");
        assert_eq!(encode(&Value::Boolean(true)).unwrap()[..], *b"\x04true");
        assert_eq!(encode(&Value::Number(3.0)).unwrap()[0], TAG_NUMBER);
    }

    #[test]
    fn test_unknown_tag() {
        let err = decode(&[9, b'1']).unwrap_err();
        assert!(matches!(err, Error::UnknownDataType(9)));
    }

    #[test]
    fn test_empty_value_is_malformed() {
        assert!(matches!(decode(&[]), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_non_finite_number_rejected() {
        assert!(encode(&Value::Number(f64::NAN)).is_err());
    }

    #[test]
    fn test_pack_unpack() {
        let buffers: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9, 10]];
        let packed = pack(&buffers).unwrap();
        let parts = unpack(&packed).unwrap();
        assert_eq!(parts, buffers);
    }

    #[test]
    fn test_pack_unpack_with_empty_parts() {
        let cases: Vec<Vec<Vec<u8>>> = vec![
            vec![],
            vec![vec![]],
            vec![vec![], vec![1], vec![]],
            vec![vec![0; 70_000], vec![], vec![42]],
        ];
        for buffers in cases {
            let packed = pack(&buffers).unwrap();
            assert_eq!(unpack(&packed).unwrap(), buffers);
        }
    }

    #[test]
    fn test_pack_layout() {
        let packed = pack(&[b"ab".as_slice(), b"".as_slice()]).unwrap();
        assert_eq!(packed[..], [0, 8, 0, 0, 0, 2, 0, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_unpack_truncated() {
        let packed = pack(&[b"hello".as_slice()]).unwrap();
        let truncated = packed.slice(..packed.len() - 1);
        assert!(matches!(unpack(&truncated), Err(Error::MalformedFrame(_))));
        assert!(matches!(unpack(&Bytes::from_static(&[0])), Err(Error::MalformedFrame(_))));
    }
}
