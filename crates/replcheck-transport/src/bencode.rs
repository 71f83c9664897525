//! Bencode codec for the evaluation server wire format.
//!
//! Decoding is incremental: [`decode_prefix`] reports `Ok(None)` while the
//! buffer holds only part of a value so the caller can read more bytes.

use std::collections::BTreeMap;

use thiserror::Error;

const MAX_NESTING_DEPTH: usize = 64;
const MAX_BYTE_STRING_LEN: usize = 64 * 1024 * 1024;

/// One bencode value. Dictionary keys are raw byte strings kept in sorted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn text(value: impl AsRef<str>) -> Self {
        Self::Bytes(value.as_ref().as_bytes().to_vec())
    }

    /// Lossy UTF-8 view of a byte string.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected byte 0x{byte:02x} at offset {offset}")]
    UnexpectedByte { offset: usize, byte: u8 },
    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),
    #[error("invalid byte-string length at offset {0}")]
    InvalidLength(usize),
    #[error("byte string of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),
    #[error("nesting deeper than {MAX_NESTING_DEPTH} levels")]
    TooDeep,
}

pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(number) => {
            out.push(b'i');
            out.extend_from_slice(number.to_string().as_bytes());
            out.push(b'e');
        }
        BencodeValue::Bytes(bytes) => encode_bytes(bytes, out),
        BencodeValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        BencodeValue::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                encode_bytes(key, out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Decodes the first complete value in `buffer`, returning it with the
/// number of bytes consumed, or `Ok(None)` if more input is needed.
pub fn decode_prefix(buffer: &[u8]) -> Result<Option<(BencodeValue, usize)>, BencodeError> {
    let mut cursor = Cursor { buffer, offset: 0 };
    match cursor.value(0)? {
        Some(value) => Ok(Some((value, cursor.offset))),
        None => Ok(None),
    }
}

struct Cursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.buffer.get(self.offset).copied()
    }

    fn value(&mut self, depth: usize) -> Result<Option<BencodeValue>, BencodeError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        let Some(byte) = self.peek() else {
            return Ok(None);
        };
        match byte {
            b'i' => self.integer(),
            b'0'..=b'9' => Ok(self.bytes()?.map(BencodeValue::Bytes)),
            b'l' => {
                self.offset += 1;
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        None => return Ok(None),
                        Some(b'e') => {
                            self.offset += 1;
                            return Ok(Some(BencodeValue::List(items)));
                        }
                        Some(_) => match self.value(depth + 1)? {
                            Some(item) => items.push(item),
                            None => return Ok(None),
                        },
                    }
                }
            }
            b'd' => {
                self.offset += 1;
                let mut entries = BTreeMap::new();
                loop {
                    match self.peek() {
                        None => return Ok(None),
                        Some(b'e') => {
                            self.offset += 1;
                            return Ok(Some(BencodeValue::Dict(entries)));
                        }
                        Some(b'0'..=b'9') => {
                            let Some(key) = self.bytes()? else {
                                return Ok(None);
                            };
                            let Some(item) = self.value(depth + 1)? else {
                                return Ok(None);
                            };
                            entries.insert(key, item);
                        }
                        Some(_) => return Err(BencodeError::NonStringKey(self.offset)),
                    }
                }
            }
            other => Err(BencodeError::UnexpectedByte {
                offset: self.offset,
                byte: other,
            }),
        }
    }

    fn integer(&mut self) -> Result<Option<BencodeValue>, BencodeError> {
        let start = self.offset;
        let body_start = start + 1;
        let Some(end) = self.buffer[body_start..].iter().position(|byte| *byte == b'e') else {
            if self.buffer[body_start..]
                .iter()
                .all(|byte| byte.is_ascii_digit() || *byte == b'-')
            {
                return Ok(None);
            }
            return Err(BencodeError::InvalidInteger(start));
        };
        let digits = std::str::from_utf8(&self.buffer[body_start..body_start + end])
            .map_err(|_| BencodeError::InvalidInteger(start))?;
        let number = digits
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger(start))?;
        self.offset = body_start + end + 1;
        Ok(Some(BencodeValue::Integer(number)))
    }

    fn bytes(&mut self) -> Result<Option<Vec<u8>>, BencodeError> {
        let start = self.offset;
        let Some(colon) = self.buffer[start..].iter().position(|byte| *byte == b':') else {
            if self.buffer[start..].iter().all(u8::is_ascii_digit) {
                return Ok(None);
            }
            return Err(BencodeError::InvalidLength(start));
        };
        let length = std::str::from_utf8(&self.buffer[start..start + colon])
            .ok()
            .and_then(|digits| digits.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidLength(start))?;
        if length > MAX_BYTE_STRING_LEN {
            return Err(BencodeError::TooLarge(length));
        }
        let body_start = start + colon + 1;
        let Some(body) = self.buffer.get(body_start..body_start + length) else {
            return Ok(None);
        };
        self.offset = body_start + length;
        Ok(Some(body.to_vec()))
    }
}
