//! Envelope header: magic, format version, codec, and payload geometry.
//!
//! Layout on the wire is `magic | header_len: u32 LE | header JSON |
//! payload bytes`. The header is JSON so future versions can add fields
//! without breaking older layouts; binary compactness only matters for the
//! payload, which dwarfs the header.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime::VersionInfo;
use crate::wire::{RefTable, RefValue};

use super::chunked::ChunkInfo;
use super::codec::Codec;

/// First four bytes of every envelope.
pub const MAGIC: [u8; 4] = *b"GPAK";

/// Newest format version this build reads and writes.
pub const MAX_FORMAT_VERSION: i32 = 4;

/// Version at which metatables and hook tags appeared.
pub const VERSION_EXTENDED_TABLES: i32 = 1;
/// Version at which chunked payloads appeared.
pub const VERSION_CHUNKING: i32 = 2;
/// Version at which env-location entries appeared.
pub const VERSION_ENV_LOCATIONS: i32 = 3;
/// Version at which userdata entries appeared.
pub const VERSION_USERDATA: i32 = 4;

/// Headers larger than this are rejected as malformed.
const MAX_HEADER_LEN: u32 = 1 << 24;

/// Decoded envelope header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub format_version: i32,
    pub codec: Codec,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
    #[serde(default)]
    pub version_info: VersionInfo,
    /// Chunk directory; absent for unchunked payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkInfo>>,
}

/// The lowest format version able to represent this payload.
///
/// Writers stamp envelopes with this rather than the newest version, so
/// output stays readable by older decoders whenever the data allows it.
pub fn required_version(refs: &RefTable, chunked: bool) -> i32 {
    let mut version = 0;
    if chunked {
        version = version.max(VERSION_CHUNKING);
    }
    for entry in refs.iter() {
        match entry {
            RefValue::UserData { .. } => version = version.max(VERSION_USERDATA),
            RefValue::EnvLocation { .. } => version = version.max(VERSION_ENV_LOCATIONS),
            RefValue::Table(t) if t.has_extended_fields() => {
                version = version.max(VERSION_EXTENDED_TABLES)
            }
            _ => {}
        }
        if version == MAX_FORMAT_VERSION {
            break;
        }
    }
    version
}

/// Write the magic and length-prefixed header.
pub fn write_header<W: Write>(writer: &mut W, header: &Header) -> Result<()> {
    let bytes = serde_json::to_vec(header)
        .map_err(|e| Error::malformed(format!("header encoding failed: {e}")))?;
    writer.write_all(&MAGIC)?;
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Read and validate the magic and header.
///
/// The magic is checked first, then the format version, before anything is
/// assumed about the payload. Unknown header fields are ignored so version
/// checks fire before parse errors on future layouts.
pub fn read_header<R: Read>(reader: &mut R) -> Result<Header> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::InvalidMagic(magic));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(Error::malformed(format!("implausible header length {len}")));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    let header: Header = serde_json::from_slice(&bytes)
        .map_err(|e| Error::malformed(format!("header parsing failed: {e}")))?;

    if header.format_version < 0 || header.format_version > MAX_FORMAT_VERSION {
        return Err(Error::VersionMismatch {
            version: header.format_version,
            max_supported: MAX_FORMAT_VERSION,
        });
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireTable;

    fn header(version: i32) -> Header {
        Header {
            format_version: version,
            codec: Codec::Lz4,
            uncompressed_len: 10,
            compressed_len: 8,
            version_info: VersionInfo::default(),
            chunks: None,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf, &header(2)).unwrap();
        assert_eq!(&buf[..4], b"GPAK");

        let out = read_header(&mut buf.as_slice()).unwrap();
        assert_eq!(out.format_version, 2);
        assert_eq!(out.codec, Codec::Lz4);
        assert_eq!(out.uncompressed_len, 10);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf, &header(0)).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            read_header(&mut buf.as_slice()),
            Err(Error::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf, &header(999)).unwrap();
        assert!(matches!(
            read_header(&mut buf.as_slice()),
            Err(Error::VersionMismatch {
                version: 999,
                max_supported: MAX_FORMAT_VERSION
            })
        ));
    }

    #[test]
    fn test_required_version() {
        let plain = RefTable::from_entries(vec![RefValue::Str(b"x".to_vec())]);
        assert_eq!(required_version(&plain, false), 0);
        assert_eq!(required_version(&plain, true), VERSION_CHUNKING);

        let mut tagged = WireTable::default();
        tagged.metatable = Some(crate::wire::Primitive::Nil);
        let refs = RefTable::from_entries(vec![RefValue::Table(tagged)]);
        assert_eq!(required_version(&refs, false), VERSION_EXTENDED_TABLES);

        let refs = RefTable::from_entries(vec![RefValue::EnvLocation {
            env: crate::wire::Primitive::Nil,
            key: crate::wire::Primitive::Nil,
        }]);
        assert_eq!(required_version(&refs, false), VERSION_ENV_LOCATIONS);

        let refs = RefTable::from_entries(vec![RefValue::UserData {
            type_key: "k".into(),
            payload: Vec::new(),
        }]);
        assert_eq!(required_version(&refs, false), VERSION_USERDATA);
    }
}
