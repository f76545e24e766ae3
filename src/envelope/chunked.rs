//! Chunked payload compression.
//!
//! Large payloads are split into fixed-size chunks, each compressed
//! independently, so the peak memory of decoding is one chunk rather than
//! the whole payload. Chunk boundaries are recorded in the header; the
//! chunks themselves are just concatenated in order. Compression is
//! chunk-parallel.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::codec::Codec;

/// Sizes of one compressed chunk, recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub compressed_len: u64,
    pub uncompressed_len: u64,
}

/// Compress `data` in independent chunks of at most `chunk_len` bytes.
///
/// Returns the chunk directory and the concatenated compressed bytes.
/// `chunk_len` must be non-zero.
pub fn compress_chunks(
    codec: Codec,
    data: &[u8],
    chunk_len: usize,
) -> Result<(Vec<ChunkInfo>, Vec<u8>)> {
    if chunk_len == 0 {
        return Err(Error::malformed("chunk length must be non-zero"));
    }
    let compressed: Vec<(ChunkInfo, Vec<u8>)> = data
        .par_chunks(chunk_len)
        .map(|chunk| {
            let bytes = codec.compress(chunk)?;
            let info = ChunkInfo {
                compressed_len: bytes.len() as u64,
                uncompressed_len: chunk.len() as u64,
            };
            Ok((info, bytes))
        })
        .collect::<Result<_>>()?;

    let mut directory = Vec::with_capacity(compressed.len());
    let mut out = Vec::new();
    for (info, bytes) in compressed {
        directory.push(info);
        out.extend_from_slice(&bytes);
    }
    Ok((directory, out))
}

/// Decompress a chunked payload against its header directory.
///
/// Fails with [`Error::Malformed`] if the data is shorter than the directory
/// claims, has trailing bytes, or any chunk fails to decompress to its
/// recorded size.
pub fn decompress_chunks(codec: Codec, chunks: &[ChunkInfo], data: &[u8]) -> Result<Vec<u8>> {
    let mut slices = Vec::with_capacity(chunks.len());
    let mut offset = 0usize;
    for (i, info) in chunks.iter().enumerate() {
        let len = info.compressed_len as usize;
        let end = offset.checked_add(len).filter(|&e| e <= data.len()).ok_or_else(|| {
            Error::malformed(format!(
                "chunk {i} claims {len} bytes but only {} remain",
                data.len() - offset
            ))
        })?;
        slices.push((info, &data[offset..end]));
        offset = end;
    }
    if offset != data.len() {
        return Err(Error::malformed(format!(
            "{} trailing bytes after the last chunk",
            data.len() - offset
        )));
    }

    let decompressed: Vec<Vec<u8>> = slices
        .into_par_iter()
        .map(|(info, bytes)| codec.decompress(bytes, info.uncompressed_len as usize))
        .collect::<Result<_>>()?;

    let total: usize = decompressed.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in decompressed {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
