//! Exceptions transported between tasklets
//!
//! Exceptions are plain data: a kind, a payload value, and a traceback that
//! grows a segment each time the exception crosses a tasklet boundary
//! (channel transfer or kill injection). They are re-raised at the receiving
//! side with type and payload unchanged.

use crate::value::Value;
use std::fmt;
use std::io::{Read, Write};

/// Distinguishes cooperative cancellation from application errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExcKind {
    /// Cooperative cancellation signal injected by `kill`. Catchable, but a
    /// tasklet that lets it propagate dies silently instead of escalating.
    TaskletExit,
    /// An application exception
    Error,
}

/// An exception value in flight between tasklets
#[derive(Debug, Clone, PartialEq)]
pub struct Exc {
    /// What kind of exception this is
    pub kind: ExcKind,
    /// Exception payload
    pub value: Value,
    /// Traceback segments, oldest first
    pub traceback: Vec<String>,
}

impl Exc {
    /// Create an application exception
    pub fn error(value: Value) -> Self {
        Self {
            kind: ExcKind::Error,
            value,
            traceback: Vec::new(),
        }
    }

    /// Create the cancellation signal raised by `kill`
    pub fn tasklet_exit() -> Self {
        Self {
            kind: ExcKind::TaskletExit,
            value: Value::Null,
            traceback: Vec::new(),
        }
    }

    /// Whether this is the cooperative cancellation signal
    pub fn is_exit(&self) -> bool {
        self.kind == ExcKind::TaskletExit
    }

    /// Append a traceback segment, returning self for chaining
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.traceback.push(frame.into());
        self
    }

    /// Append a traceback segment in place (used at transfer boundaries)
    pub fn push_frame(&mut self, frame: impl Into<String>) {
        self.traceback.push(frame.into());
    }

    /// Encode in the portable format
    pub fn encode(&self, writer: &mut impl Write) -> std::io::Result<()> {
        let kind = match self.kind {
            ExcKind::TaskletExit => 0u8,
            ExcKind::Error => 1u8,
        };
        writer.write_all(&[kind])?;
        self.value.encode(writer)?;
        writer.write_all(&(self.traceback.len() as u32).to_le_bytes())?;
        for frame in &self.traceback {
            writer.write_all(&(frame.len() as u32).to_le_bytes())?;
            writer.write_all(frame.as_bytes())?;
        }
        Ok(())
    }

    /// Decode an exception previously written by [`Exc::encode`]
    pub fn decode(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        let kind = match byte[0] {
            0 => ExcKind::TaskletExit,
            1 => ExcKind::Error,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown exception kind: {}", other),
                ))
            }
        };

        let value = Value::decode(reader)?;

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        let count = u32::from_le_bytes(buf) as usize;

        let mut traceback = Vec::with_capacity(count);
        for _ in 0..count {
            reader.read_exact(&mut buf)?;
            let len = u32::from_le_bytes(buf) as usize;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            let frame = String::from_utf8(bytes).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid utf-8 in traceback")
            })?;
            traceback.push(frame);
        }

        Ok(Self {
            kind,
            value,
            traceback,
        })
    }
}

impl fmt::Display for Exc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ExcKind::TaskletExit => write!(f, "TaskletExit")?,
            ExcKind::Error => write!(f, "{}", self.value)?,
        }
        for frame in self.traceback.iter().rev() {
            write!(f, "\n    at {}", frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_flag() {
        assert!(Exc::tasklet_exit().is_exit());
        assert!(!Exc::error(Value::Int(1)).is_exit());
    }

    #[test]
    fn test_traceback_accumulates() {
        let exc = Exc::error(Value::str("boom"))
            .with_frame("producer")
            .with_frame("channel send");
        assert_eq!(exc.traceback.len(), 2);
        assert_eq!(exc.traceback[0], "producer");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let exc = Exc::error(Value::str("boom")).with_frame("origin");
        let mut buf = Vec::new();
        exc.encode(&mut buf).unwrap();
        let decoded = Exc::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, exc);
    }

    #[test]
    fn test_display_includes_trace() {
        let exc = Exc::error(Value::str("boom")).with_frame("origin");
        let rendered = exc.to_string();
        assert!(rendered.contains("boom"));
        assert!(rendered.contains("origin"));
    }
}
