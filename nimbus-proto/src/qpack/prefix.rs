//! Prefix-N integers and length-prefixed strings, shared by field lines and
//! the encoder/decoder stream instructions.
//!
//! An integer uses a fixed number of bits in its first byte, spilling into
//! base-128 continuation bytes when too large. See RFC 7541 section 5.1.

use bytes::{Buf, BufMut};

use super::{huffman, QpackError};

#[cfg(target_pointer_width = "64")]
const MAX_POWER: usize = 10 * 7;

#[cfg(target_pointer_width = "32")]
const MAX_POWER: usize = 5 * 7;

pub fn decode_prefix<B: Buf>(buf: &mut B, size: u8) -> Result<(u8, usize), QpackError> {
    assert!(size <= 8);

    if !buf.has_remaining() {
        return Err(QpackError::ShortRead);
    }

    let mut first = buf.get_u8();

    // NOTE: the casts trim the most significant bits; they work around shift
    // overflow when size == 8.
    let flags = ((first as usize) >> size) as u8;
    let mask = 0xff >> (8 - size);
    first &= mask;

    if first < mask {
        return Ok((flags, first as usize));
    }

    let mut value = mask as usize;
    let mut power = 0usize;
    loop {
        if !buf.has_remaining() {
            return Err(QpackError::ShortRead);
        }

        let byte = buf.get_u8() as usize;
        value += (byte & 127) << power;
        power += 7;

        if byte & 128 == 0 {
            break;
        }

        if power >= MAX_POWER {
            return Err(QpackError::BoundsExceeded);
        }
    }

    Ok((flags, value))
}

pub fn encode_prefix<B: BufMut>(buf: &mut B, size: u8, flags: u8, value: usize) {
    assert!(size > 0 && size <= 8);

    // NOTE: the casts trim the most significant bits; they work around shift
    // overflow when size == 8.
    let mask = !(0xff << size) as u8;
    let flags = ((flags as usize) << size) as u8;

    if value < (mask as usize) {
        buf.put_u8(flags | value as u8);
        return;
    }

    buf.put_u8(mask | flags);
    let mut remaining = value - mask as usize;

    while remaining >= 128 {
        buf.put_u8((remaining % 128) as u8 + 128);
        remaining /= 128;
    }

    buf.put_u8(remaining as u8);
}

/// Decode a string with a `prefix`-bit length, the H bit directly above it,
/// and any pattern bits above that. Returns the pattern bits and raw bytes.
pub fn decode_string<B: Buf>(buf: &mut B, prefix: u8) -> Result<(u8, Vec<u8>), QpackError> {
    // The H bit is decoded as the lowest flag bit of a (prefix + 1)-bit read.
    let (flags, len) = decode_prefix(buf, prefix)?;
    if buf.remaining() < len {
        return Err(QpackError::ShortRead);
    }

    let payload = buf.copy_to_bytes(len);
    let huffman = flags & 1 == 1;
    let value = if huffman {
        huffman::decode(&payload)?
    } else {
        payload.to_vec()
    };

    Ok((flags >> 1, value))
}

/// Encode a string with the H bit directly above a `prefix`-bit length, and
/// `flags` above that. Huffman is applied when it shrinks the output.
pub fn encode_string<B: BufMut>(buf: &mut B, prefix: u8, flags: u8, data: &[u8]) {
    let hlen = huffman::encoded_len(data);
    if hlen < data.len() {
        encode_prefix(buf, prefix, (flags << 1) | 1, hlen);
        huffman::encode(data, buf);
    } else {
        encode_prefix(buf, prefix, flags << 1, data.len());
        buf.put_slice(data);
    }
}
