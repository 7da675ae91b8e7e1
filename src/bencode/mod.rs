//! Strict Bencode reader/writer and the netstring framing used by the ack
//! sub-protocol.
//!
//! Byte-strings surface as [`Bytes`] and are never interpreted as text here;
//! the message layer decides which fields become UTF-8. Dictionaries are
//! emitted with keys sorted by raw byte sequence. The decoder enforces the
//! grammar strictly: `i0e` is the only integer with a leading zero, `-0` is
//! rejected, and length prefixes may not carry leading zeros.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use bytes::Bytes;
use thiserror::Error;

/// A single Bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// A byte-string holding UTF-8 text.
    pub fn text(text: &str) -> Value {
        Value::Bytes(Bytes::copy_from_slice(text.as_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: u64 },
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: u64 },
    #[error("malformed integer: {reason}")]
    MalformedInt { reason: &'static str },
    #[error("malformed length prefix: {reason}")]
    MalformedLength { reason: &'static str },
    #[error("dictionary key at offset {offset} is not a byte-string")]
    NonStringKey { offset: u64 },
    #[error("value exceeds limit of {limit} bytes")]
    ValueTooLarge { limit: usize },
    #[error("trailing bytes after value")]
    TrailingBytes,
    #[error("netstring missing trailing comma")]
    NetstringUnterminated,
}

impl BencodeError {
    /// True when the failure is a closed/broken underlying stream rather
    /// than a grammar violation. Transports map these to EOF, everything
    /// else is fatal protocol breakage.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BencodeError::Io(_))
    }
}

/// Streaming decoder: pulls one value at a time off a byte stream.
pub struct Decoder<R> {
    reader: R,
    offset: u64,
    max_value_bytes: usize,
    consumed: usize,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R, max_value_bytes: usize) -> Self {
        Self {
            reader,
            offset: 0,
            max_value_bytes,
            consumed: 0,
        }
    }

    /// Decode the next value. `Ok(None)` on clean end-of-stream at a value
    /// boundary; end-of-stream anywhere else is an error.
    pub fn decode_next(&mut self) -> Result<Option<Value>, BencodeError> {
        self.consumed = 0;
        match self.try_read_byte()? {
            None => Ok(None),
            Some(byte) => self.decode_value(byte).map(Some),
        }
    }

    fn decode_value(&mut self, dispatch: u8) -> Result<Value, BencodeError> {
        match dispatch {
            b'i' => self.decode_int(),
            b'0'..=b'9' => {
                let len = self.decode_length(dispatch)?;
                self.decode_bytes(len).map(Value::Bytes)
            }
            b'l' => {
                let mut items = Vec::new();
                loop {
                    let byte = self.read_byte()?;
                    if byte == b'e' {
                        return Ok(Value::List(items));
                    }
                    items.push(self.decode_value(byte)?);
                }
            }
            b'd' => {
                let mut entries = BTreeMap::new();
                loop {
                    let byte = self.read_byte()?;
                    if byte == b'e' {
                        return Ok(Value::Dict(entries));
                    }
                    if !byte.is_ascii_digit() {
                        return Err(BencodeError::NonStringKey {
                            offset: self.offset - 1,
                        });
                    }
                    let len = self.decode_length(byte)?;
                    let key = self.decode_bytes(len)?;
                    let byte = self.read_byte()?;
                    let value = self.decode_value(byte)?;
                    entries.insert(key, value);
                }
            }
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                offset: self.offset - 1,
            }),
        }
    }

    fn decode_int(&mut self) -> Result<Value, BencodeError> {
        let mut digits = Vec::new();
        loop {
            let byte = self.read_byte()?;
            if byte == b'e' {
                break;
            }
            digits.push(byte);
        }
        let negative = digits.first() == Some(&b'-');
        let magnitude: &[u8] = if negative { &digits[1..] } else { &digits };
        if magnitude.is_empty() {
            return Err(BencodeError::MalformedInt {
                reason: "no digits",
            });
        }
        if !magnitude.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::MalformedInt {
                reason: "non-digit character",
            });
        }
        if magnitude[0] == b'0' && (negative || magnitude.len() > 1) {
            return Err(BencodeError::MalformedInt {
                reason: "leading zero or negative zero",
            });
        }
        let text = std::str::from_utf8(&digits).expect("ascii digits");
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| BencodeError::MalformedInt {
                reason: "out of i64 range",
            })
    }

    /// Parse a length prefix whose first digit has already been consumed.
    fn decode_length(&mut self, first: u8) -> Result<usize, BencodeError> {
        let mut digits = vec![first];
        loop {
            let byte = self.read_byte()?;
            if byte == b':' {
                break;
            }
            if !byte.is_ascii_digit() {
                return Err(BencodeError::MalformedLength {
                    reason: "non-digit character",
                });
            }
            digits.push(byte);
        }
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(BencodeError::MalformedLength {
                reason: "leading zero",
            });
        }
        let text = std::str::from_utf8(&digits).expect("ascii digits");
        text.parse().map_err(|_| BencodeError::MalformedLength {
            reason: "out of range",
        })
    }

    /// Read the content of a byte-string in bounded chunks, so a hostile
    /// length prefix cannot force a giant allocation before the size limit
    /// trips.
    fn decode_bytes(&mut self, len: usize) -> Result<Bytes, BencodeError> {
        const CHUNK: usize = 8 * 1024;
        let mut buf = Vec::with_capacity(len.min(CHUNK));
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(CHUNK);
            let start = buf.len();
            buf.resize(start + want, 0);
            let n = self.reader.read(&mut buf[start..])?;
            buf.truncate(start + n);
            if n == 0 {
                return Err(BencodeError::UnexpectedEof {
                    offset: self.offset,
                });
            }
            remaining -= n;
            self.offset += n as u64;
            self.bump_consumed(n)?;
        }
        Ok(Bytes::from(buf))
    }

    fn read_byte(&mut self) -> Result<u8, BencodeError> {
        match self.try_read_byte()? {
            Some(byte) => Ok(byte),
            None => Err(BencodeError::UnexpectedEof {
                offset: self.offset,
            }),
        }
    }

    fn try_read_byte(&mut self) -> Result<Option<u8>, BencodeError> {
        let mut buf = [0u8; 1];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    self.bump_consumed(1)?;
                    return Ok(Some(buf[0]));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn bump_consumed(&mut self, n: usize) -> Result<(), BencodeError> {
        self.consumed = self.consumed.saturating_add(n);
        if self.consumed > self.max_value_bytes {
            return Err(BencodeError::ValueTooLarge {
                limit: self.max_value_bytes,
            });
        }
        Ok(())
    }
}

/// Decode exactly one value from a byte slice, rejecting trailing input.
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder::new(input, input.len().max(1));
    let value = decoder.decode_next()?.ok_or(BencodeError::UnexpectedEof {
        offset: 0,
    })?;
    match decoder.decode_next()? {
        None => Ok(value),
        Some(_) => Err(BencodeError::TrailingBytes),
    }
}

/// Encode one value into a fresh buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_to(value, &mut out).expect("write to Vec cannot fail");
    out
}

pub fn encode_to(value: &Value, out: &mut impl Write) -> io::Result<()> {
    match value {
        Value::Int(n) => {
            write!(out, "i{n}e")
        }
        Value::Bytes(bytes) => {
            write!(out, "{}:", bytes.len())?;
            out.write_all(bytes)
        }
        Value::List(items) => {
            out.write_all(b"l")?;
            for item in items {
                encode_to(item, out)?;
            }
            out.write_all(b"e")
        }
        Value::Dict(entries) => {
            // BTreeMap<Bytes, _> iterates in raw-byte order, which is the
            // required on-wire key order.
            out.write_all(b"d")?;
            for (key, item) in entries {
                write!(out, "{}:", key.len())?;
                out.write_all(key)?;
                encode_to(item, out)?;
            }
            out.write_all(b"e")
        }
    }
}

/// Write one netstring frame: `<len>:<bytes>,`.
pub fn encode_netstring(payload: &[u8], out: &mut impl Write) -> io::Result<()> {
    write!(out, "{}:", payload.len())?;
    out.write_all(payload)?;
    out.write_all(b",")
}

/// Read one netstring frame. `Ok(None)` on clean end-of-stream.
pub fn read_netstring<R: Read>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, BencodeError> {
    let mut digits = Vec::new();
    let mut buf = [0u8; 1];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            if digits.is_empty() {
                return Ok(None);
            }
            return Err(BencodeError::UnexpectedEof {
                offset: digits.len() as u64,
            });
        }
        match buf[0] {
            b':' => break,
            byte if byte.is_ascii_digit() => digits.push(byte),
            byte => {
                return Err(BencodeError::UnexpectedByte {
                    byte,
                    offset: digits.len() as u64,
                });
            }
        }
    }
    if digits.is_empty() {
        return Err(BencodeError::MalformedLength { reason: "no digits" });
    }
    if digits[0] == b'0' && digits.len() > 1 {
        return Err(BencodeError::MalformedLength {
            reason: "leading zero",
        });
    }
    let len: usize = std::str::from_utf8(&digits)
        .expect("ascii digits")
        .parse()
        .map_err(|_| BencodeError::MalformedLength {
            reason: "out of range",
        })?;
    if len > max_bytes {
        return Err(BencodeError::ValueTooLarge { limit: max_bytes });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    reader.read_exact(&mut buf)?;
    if buf[0] != b',' {
        return Err(BencodeError::NetstringUnterminated);
    }
    Ok(Some(payload))
}
