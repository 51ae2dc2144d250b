//! Variable-length integer and string encoding used throughout the wire
//! protocol (§4.1).

use crate::error::CodecError;
use bytes::{Buf, BufMut};

/// Encode `value` as a VarInt: values below 0xfd are a single raw byte;
/// 0xfd/0xfe/0xff prefix a u16/u32/u64 respectively.
pub fn write_varint(buf: &mut impl BufMut, value: u64) {
    if value < 0xfd {
        buf.put_u8(value as u8);
    } else if value <= u16::MAX as u64 {
        buf.put_u8(0xfd);
        buf.put_u16_le(value as u16);
    } else if value <= u32::MAX as u64 {
        buf.put_u8(0xfe);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(0xff);
        buf.put_u64_le(value);
    }
}

/// Decode a VarInt from the front of `buf`, advancing it past the bytes
/// consumed. Returns `MalformedPayload` if `buf` is too short.
pub fn read_varint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::MalformedPayload("empty varint".into()));
    }
    let prefix = buf.get_u8();
    match prefix {
        0xfd => {
            require(buf, 2)?;
            Ok(buf.get_u16_le() as u64)
        }
        0xfe => {
            require(buf, 4)?;
            Ok(buf.get_u32_le() as u64)
        }
        0xff => {
            require(buf, 8)?;
            Ok(buf.get_u64_le())
        }
        n => Ok(n as u64),
    }
}

fn require(buf: &impl Buf, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::MalformedPayload(format!(
            "expected {} more bytes, got {}",
            n,
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

/// Write a VarInt-prefixed byte string.
pub fn write_var_bytes(buf: &mut impl BufMut, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Read a VarInt-prefixed byte string, capped at `max_len` to avoid a
/// malicious peer claiming an enormous length and exhausting memory.
pub fn read_var_bytes(buf: &mut impl Buf, max_len: usize) -> Result<Vec<u8>, CodecError> {
    let len = read_varint(buf)? as usize;
    if len > max_len {
        return Err(CodecError::MalformedPayload(format!(
            "var_bytes length {} exceeds cap {}",
            len, max_len
        )));
    }
    require(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn write_var_str(buf: &mut impl BufMut, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

pub fn read_var_str(buf: &mut impl Buf, max_len: usize) -> Result<String, CodecError> {
    let bytes = read_var_bytes(buf, max_len)?;
    String::from_utf8(bytes)
        .map_err(|e| CodecError::MalformedPayload(format!("invalid utf-8 string: {}", e)))
}
