//! Variable-length integer encoding (LEB128)
//!
//! Uses unsigned LEB128 for compact representation of lengths and indices.
//! Small values (0-127) use 1 byte, larger values use more bytes.

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Encode a u64 as varint and write to a writer.
pub fn encode_varint_to<W: Write>(mut value: u64, writer: &mut W) -> Result<usize> {
    let mut bytes_written = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            writer.write_all(&[byte])?;
            return Ok(bytes_written + 1);
        }
        writer.write_all(&[byte | 0x80])?;
        bytes_written += 1;
    }
}

/// Decode a varint from a reader.
pub fn decode_varint_from<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut buf = [0u8; 1];

    loop {
        if shift >= 64 {
            return Err(Error::VarintOverflow);
        }

        reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::InvalidVarint
            } else {
                Error::Io(e)
            }
        })?;

        let byte = buf[0];
        let value = u64::from(byte & 0x7F);

        // Check for overflow before shifting
        if shift == 63 && value > 1 {
            return Err(Error::VarintOverflow);
        }

        result |= value << shift;

        if byte & 0x80 == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Encode an i64 as a zigzag varint (small magnitudes stay small).
pub fn encode_varint_i64_to<W: Write>(value: i64, writer: &mut W) -> Result<usize> {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    encode_varint_to(zigzag, writer)
}

/// Decode a zigzag varint back into an i64.
pub fn decode_varint_i64_from<R: Read>(reader: &mut R) -> Result<i64> {
    let zigzag = decode_varint_from(reader)?;
    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}
