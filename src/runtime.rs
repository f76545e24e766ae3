//! Runtime identity carried in the envelope header.
//!
//! Function code blobs are only loadable by the runtime flavor that produced
//! them, so every envelope records which one that was. Decoders compare the
//! recorded fingerprint against their own and refuse to materialize
//! functions across a mismatch; everything else still decodes.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Identity of the runtime that produced an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Fingerprint of the compiled-code format. Empty means "unknown":
    /// unknown fingerprints never match a non-empty one.
    pub code_fingerprint: String,
    /// Human-readable runtime version, for diagnostics only.
    pub interpreter_version: String,
}

impl VersionInfo {
    /// Build version info for a runtime, fingerprinting its code format tag.
    pub fn new(interpreter_version: impl Into<String>, code_format: &[u8]) -> Self {
        Self {
            code_fingerprint: fingerprint(code_format),
            interpreter_version: interpreter_version.into(),
        }
    }

    /// Whether code produced under `self` is loadable by `other`.
    pub fn code_compatible(&self, other: &VersionInfo) -> bool {
        !self.code_fingerprint.is_empty() && self.code_fingerprint == other.code_fingerprint
    }
}

/// Stable 64-bit content fingerprint, hex-encoded.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:016x}", xxh3_64(bytes))
}
