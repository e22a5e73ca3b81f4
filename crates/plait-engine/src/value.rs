//! Values transferred over channels and captured in continuations

use std::fmt;
use std::io::{Read, Write};

/// A value that can cross a channel or live in a captured continuation frame.
///
/// Tasklet-local state that never crosses a channel and is never captured can
/// be anything the tasklet body likes; `Value` is only the portable subset.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 string
    Str(String),
}

// Wire tags for the portable encoding
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;

impl Value {
    /// Shorthand for `Value::Str`
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Interpret as an integer, if this value is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Interpret as a string slice, if this value is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Encode in the portable little-endian tagged format
    pub fn encode(&self, writer: &mut impl Write) -> std::io::Result<()> {
        match self {
            Value::Null => writer.write_all(&[TAG_NULL]),
            Value::Bool(b) => {
                writer.write_all(&[TAG_BOOL])?;
                writer.write_all(&[*b as u8])
            }
            Value::Int(n) => {
                writer.write_all(&[TAG_INT])?;
                writer.write_all(&n.to_le_bytes())
            }
            Value::Float(f) => {
                writer.write_all(&[TAG_FLOAT])?;
                writer.write_all(&f.to_bits().to_le_bytes())
            }
            Value::Str(s) => {
                writer.write_all(&[TAG_STR])?;
                writer.write_all(&(s.len() as u32).to_le_bytes())?;
                writer.write_all(s.as_bytes())
            }
        }
    }

    /// Decode a value previously written by [`Value::encode`]
    pub fn decode(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        match tag[0] {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => {
                let mut b = [0u8; 1];
                reader.read_exact(&mut b)?;
                Ok(Value::Bool(b[0] != 0))
            }
            TAG_INT => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Ok(Value::Int(i64::from_le_bytes(buf)))
            }
            TAG_FLOAT => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Ok(Value::Float(f64::from_bits(u64::from_le_bytes(buf))))
            }
            TAG_STR => {
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf)?;
                let len = u32::from_le_bytes(buf) as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                String::from_utf8(bytes)
                    .map(Value::Str)
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid utf-8 in value"))
            }
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown value tag: {}", other),
            )),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) -> Value {
        let mut buf = Vec::new();
        v.encode(&mut buf).unwrap();
        Value::decode(&mut &buf[..]).unwrap()
    }

    #[test]
    fn test_encode_decode_all_variants() {
        assert_eq!(round_trip(Value::Null), Value::Null);
        assert_eq!(round_trip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(round_trip(Value::Int(-42)), Value::Int(-42));
        assert_eq!(round_trip(Value::Float(1.5)), Value::Float(1.5));
        assert_eq!(round_trip(Value::str("hello")), Value::str("hello"));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let buf = [0xFFu8];
        assert!(Value::decode(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Null.as_int(), None);
        assert_eq!(Value::str("x").as_str(), Some("x"));
    }
}
