//! Error types for the value-graph serialization engine

use std::io;
use thiserror::Error;

/// Result type alias for graphpack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
///
/// All failures are synchronous and call-aborting: no partial value graph or
/// envelope is ever handed back to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during read/write, surfaced unchanged from the transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Structurally invalid envelope or reference table
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Invalid magic number at the start of an envelope
    #[error("invalid magic number: expected GPAK, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Reference index outside the reference table
    #[error("invalid reference index: {index} >= {table_size}")]
    InvalidRef { index: i64, table_size: usize },

    /// Invalid discriminant in the binary payload
    #[error("invalid discriminant {value} for {type_name}")]
    InvalidDiscriminant { value: u8, type_name: &'static str },

    /// Invalid varint encoding
    #[error("invalid varint encoding")]
    InvalidVarint,

    /// Varint overflow
    #[error("varint overflow: value exceeds 64 bits")]
    VarintOverflow,

    /// Envelope format version newer than supported, or above the caller's cap
    #[error("unsupported format version {version} (max supported {max_supported})")]
    VersionMismatch { version: i32, max_supported: i32 },

    /// Compiled-code fingerprint incompatible with the current runtime
    #[error("code fingerprint mismatch: envelope has {envelope:?}, runtime expects {runtime:?}")]
    FingerprintMismatch { envelope: String, runtime: String },

    /// Value kind or feature not representable in the wire format
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Hook registered under an already-used key
    #[error("duplicate hook key: {0:?}")]
    DuplicateHookKey(String),
}

impl Error {
    /// Shorthand for a `Malformed` error with formatted context.
    pub fn malformed(context: impl Into<String>) -> Self {
        Self::Malformed(context.into())
    }

    /// Shorthand for an `UnsupportedType` error with formatted context.
    pub fn unsupported(context: impl Into<String>) -> Self {
        Self::UnsupportedType(context.into())
    }
}
