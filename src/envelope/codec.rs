//! Compression codecs for the envelope payload.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payload compression algorithm.
///
/// The codec is recorded in the header, so decoders never guess. `None`
/// exists for pre-compressed payloads (tensor-heavy graphs often do not
/// shrink further) and for debugging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl Codec {
    /// Name of this codec.
    pub const fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Lz4 => "lz4",
            Codec::Zstd => "zstd",
        }
    }

    /// Compress a buffer.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Lz4 => Ok(lz4_flex::block::compress(data)),
            Codec::Zstd => Ok(zstd::bulk::compress(data, zstd::DEFAULT_COMPRESSION_LEVEL)?),
        }
    }

    /// Decompress a buffer whose original size is known from the header.
    ///
    /// Fails with [`Error::Malformed`] if the data does not decompress or
    /// does not decompress to exactly `uncompressed_len` bytes.
    pub fn decompress(self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Codec::None => data.to_vec(),
            Codec::Lz4 => lz4_flex::block::decompress(data, uncompressed_len)
                .map_err(|e| Error::malformed(format!("lz4 decompression failed: {e}")))?,
            Codec::Zstd => zstd::bulk::decompress(data, uncompressed_len)
                .map_err(|e| Error::malformed(format!("zstd decompression failed: {e}")))?,
        };
        if out.len() != uncompressed_len {
            return Err(Error::malformed(format!(
                "{} payload decompressed to {} bytes, header says {}",
                self.name(),
                out.len(),
                uncompressed_len
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_codecs() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for codec in [Codec::None, Codec::Lz4, Codec::Zstd] {
            let compressed = codec.compress(&data).unwrap();
            let out = codec.decompress(&compressed, data.len()).unwrap();
            assert_eq!(out, data, "{} roundtrip", codec.name());
        }
    }

    #[test]
    fn test_compressible_data_shrinks() {
        let data = vec![0u8; 8192];
        for codec in [Codec::Lz4, Codec::Zstd] {
            assert!(codec.compress(&data).unwrap().len() < data.len());
        }
    }

    #[test]
    fn test_garbage_rejected() {
        let garbage = vec![0xFFu8; 64];
        for codec in [Codec::Lz4, Codec::Zstd] {
            assert!(matches!(
                codec.decompress(&garbage, 1024),
                Err(Error::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let compressed = Codec::None.compress(b"hello").unwrap();
        assert!(matches!(
            Codec::None.decompress(&compressed, 99),
            Err(Error::Malformed(_))
        ));
    }
}
