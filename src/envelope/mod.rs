//! Versioned envelope around a serialized value graph.
//!
//! An envelope is `magic | header | compressed payload`. The header records
//! the format version actually needed by the payload, the codec, payload
//! geometry, the producing runtime's identity, and the chunk directory for
//! chunked payloads.

pub mod chunked;
pub mod codec;
pub mod header;
pub mod payload;

use std::io::{Read, Write};

use tracing::debug;

use crate::de::{CodePolicy, Deserializer};
use crate::error::{Error, Result};
use crate::hooks::{global_registry, HookRegistry};
use crate::runtime::VersionInfo;
use crate::ser::Serializer;
use crate::value::Value;

pub use chunked::ChunkInfo;
pub use codec::Codec;
pub use header::{Header, MAGIC, MAX_FORMAT_VERSION};

/// Knobs for [`encode_to`].
#[derive(Clone)]
pub struct EncodeOptions {
    /// Payload compression codec.
    pub codec: Codec,
    /// Split payloads larger than this many bytes into independently
    /// compressed chunks. `None` disables chunking.
    pub chunk_len: Option<usize>,
    /// Refuse to produce an envelope needing a newer format version than
    /// this, for writing to readers of known vintage.
    pub max_version: i32,
    /// Identity stamped into the header.
    pub version_info: VersionInfo,
    /// Hook registry to encode with; `None` snapshots the global registry.
    pub registry: Option<HookRegistry>,
    /// Objects to serialize as external env locations instead of by value.
    pub inverted_env: Vec<(Value, (Value, Value))>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            chunk_len: None,
            max_version: MAX_FORMAT_VERSION,
            version_info: VersionInfo::default(),
            registry: None,
            inverted_env: Vec::new(),
        }
    }
}

/// Default cap on a header's claimed payload size (1 GiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 1 << 30;

/// Knobs for [`decode_from`].
#[derive(Clone)]
pub struct DecodeOptions {
    /// Refuse to materialize function code, regardless of fingerprints.
    pub skip_code: bool,
    /// Environment table that env-location entries resolve against.
    pub env: Option<Value>,
    /// Local runtime identity. When set, function entries require the
    /// envelope's code fingerprint to match it.
    pub version_info: Option<VersionInfo>,
    /// Hook registry to decode with; `None` snapshots the global registry.
    pub registry: Option<HookRegistry>,
    /// Upper bound on the header's claimed uncompressed payload size. The
    /// header length fields are attacker-controlled and drive allocation,
    /// so a header claiming more than this fails as malformed before any
    /// buffer is sized from it. Raise it for known-huge graphs.
    pub max_payload_len: u64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            skip_code: false,
            env: None,
            version_info: None,
            registry: None,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// Serialize a value graph and write the complete envelope.
pub fn encode_to<W: Write>(writer: &mut W, value: &Value, options: &EncodeOptions) -> Result<()> {
    let registry = options
        .registry
        .clone()
        .unwrap_or_else(global_registry);
    let mut serializer = Serializer::with_registry(registry);
    serializer.set_inverted_env(options.inverted_env.iter().cloned())?;
    let root = serializer.serialize(value)?;
    let refs = serializer.finish()?;

    let body = payload::encode_payload(&root, &refs)?;
    let chunk_len = options.chunk_len.filter(|&len| body.len() > len);
    let version = header::required_version(&refs, chunk_len.is_some());
    if version > options.max_version {
        return Err(Error::VersionMismatch {
            version,
            max_supported: options.max_version,
        });
    }

    let (chunks, compressed) = match chunk_len {
        Some(len) => {
            let (directory, bytes) = chunked::compress_chunks(options.codec, &body, len)?;
            (Some(directory), bytes)
        }
        None => (None, options.codec.compress(&body)?),
    };

    let header = Header {
        format_version: version,
        codec: options.codec,
        uncompressed_len: body.len() as u64,
        compressed_len: compressed.len() as u64,
        version_info: options.version_info.clone(),
        chunks,
    };
    debug!(
        version,
        codec = header.codec.name(),
        refs = refs.len(),
        uncompressed = header.uncompressed_len,
        compressed = header.compressed_len,
        "writing envelope"
    );
    header::write_header(writer, &header)?;
    writer.write_all(&compressed)?;
    Ok(())
}

/// Serialize a value graph into a byte vector.
pub fn encode_to_vec(value: &Value, options: &EncodeOptions) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_to(&mut out, value, options)?;
    Ok(out)
}

/// Read one envelope and rebuild its value graph.
pub fn decode_from<R: Read>(reader: &mut R, options: &DecodeOptions) -> Result<Value> {
    let header = header::read_header(reader)?;
    debug!(
        version = header.format_version,
        codec = header.codec.name(),
        compressed = header.compressed_len,
        "reading envelope"
    );
    if header.uncompressed_len > options.max_payload_len {
        return Err(Error::malformed(format!(
            "header claims a {} byte payload, limit is {}",
            header.uncompressed_len, options.max_payload_len
        )));
    }

    let mut compressed = Vec::new();
    reader
        .take(header.compressed_len)
        .read_to_end(&mut compressed)?;
    if compressed.len() as u64 != header.compressed_len {
        return Err(Error::malformed(format!(
            "envelope truncated: payload has {} of {} bytes",
            compressed.len(),
            header.compressed_len
        )));
    }

    let body = match &header.chunks {
        Some(chunks) => {
            let total: u64 = chunks.iter().map(|c| c.uncompressed_len).sum();
            if total != header.uncompressed_len {
                return Err(Error::malformed(format!(
                    "chunk directory sums to {total} bytes, header says {}",
                    header.uncompressed_len
                )));
            }
            chunked::decompress_chunks(header.codec, chunks, &compressed)?
        }
        None => header
            .codec
            .decompress(&compressed, header.uncompressed_len as usize)?,
    };

    let (root, refs) = payload::decode_payload(&body)?;
    let registry = options
        .registry
        .clone()
        .unwrap_or_else(global_registry);
    let mut deserializer = Deserializer::new(&refs, registry);
    if let Some(env) = &options.env {
        deserializer.set_env(env.clone());
    }
    deserializer.set_code_policy(code_policy(&header, options));
    deserializer.deserialize(&root)
}

/// Rebuild a value graph from a byte slice.
pub fn decode_from_slice(bytes: &[u8], options: &DecodeOptions) -> Result<Value> {
    decode_from(&mut &bytes[..], options)
}

fn code_policy(header: &Header, options: &DecodeOptions) -> CodePolicy {
    if options.skip_code {
        return CodePolicy::Skip;
    }
    match &options.version_info {
        Some(local) if !header.version_info.code_compatible(local) => CodePolicy::Mismatch {
            envelope: header.version_info.code_fingerprint.clone(),
            runtime: local.code_fingerprint.clone(),
        },
        _ => CodePolicy::Allow,
    }
}
