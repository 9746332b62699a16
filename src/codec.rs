//! SHALE - Scalar Value Codec
//! Byte encodings used by the typed accessors of `Store`.
//!
//! Integers are 8-byte little-endian (`int` and `int64` share the
//! encoding), booleans are `b"1"` / `b"0"` and strings are raw UTF-8.
//! Absent values decode to the type's zero value.

use crate::error::{Result, ShaleError};

const INT_WIDTH: usize = 8;

fn fixed(bytes: Option<&[u8]>) -> Result<Option<[u8; INT_WIDTH]>> {
    match bytes {
        None => Ok(None),
        Some(b) => b
            .try_into()
            .map(Some)
            .map_err(|_| ShaleError::InvalidValue {
                expected: INT_WIDTH,
                found: b.len(),
            }),
    }
}

pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

pub fn decode_u64(bytes: Option<&[u8]>) -> Result<u64> {
    Ok(fixed(bytes)?.map_or(0, u64::from_le_bytes))
}

pub fn encode_i64(value: i64) -> [u8; 8] {
    value.to_le_bytes()
}

pub fn decode_i64(bytes: Option<&[u8]>) -> Result<i64> {
    Ok(fixed(bytes)?.map_or(0, i64::from_le_bytes))
}

/// Platform integers are widened to 64 bits on disk.
pub fn encode_int(value: isize) -> [u8; 8] {
    encode_i64(value as i64)
}

/// Values written on a wider platform may not fit and are rejected.
pub fn decode_int(bytes: Option<&[u8]>) -> Result<isize> {
    let wide = decode_i64(bytes)?;
    isize::try_from(wide).map_err(|_| ShaleError::IntOutOfRange(wide))
}

pub fn encode_bool(value: bool) -> &'static [u8] {
    if value {
        b"1"
    } else {
        b"0"
    }
}

/// Only `b"1"` reads as true.
pub fn decode_bool(bytes: Option<&[u8]>) -> bool {
    bytes == Some(&b"1"[..])
}

pub fn decode_string(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}
