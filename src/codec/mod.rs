//! MQTT packet codec
//!
//! Binary framing for MQTT 3.1.1 control packets. The decoder works on a
//! borrowed byte slice and reports how much of it a complete packet used, so
//! callers can keep partial packets buffered between reads.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value a four byte remaining length can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum packet size accepted by the broker and the client
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Decode a remaining-length varint, returning `(value, bytes used)`
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value = 0u32;
    for (i, byte) in buf.iter().take(4).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    if buf.len() >= 4 {
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Append a remaining-length varint, returning the bytes written
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut rest = value;
    let mut written = 0;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        written += 1;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(written);
        }
        buf.put_u8(digit | 0x80);
    }
}

#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Length-prefixed bytes, returning `(data, bytes used)`
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let data = buf.get(2..2 + len).ok_or(DecodeError::InsufficientData)?;
    Ok((data, 2 + len))
}

/// Length-prefixed UTF-8 string, returning `(text, bytes used)`
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, used) = read_binary(buf)?;
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;

    if text.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains U+0000"));
    }
    Ok((text, used))
}

#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
