//! graphpack: cycle-safe binary serialization for dynamic-runtime value
//! graphs.
//!
//! The engine turns an arbitrary [`Value`] graph (tables, functions,
//! tensors, userdata, with any amount of sharing and any cycles) into a
//! compact, versioned, compressed envelope, and back. Sharing is preserved
//! exactly: objects that alias before encoding alias after decoding.
//!
//! # Quick start
//!
//! ```
//! use graphpack::{decode_from_slice, encode_to_vec, DecodeOptions, EncodeOptions, TableKey, Value};
//!
//! let t = Value::table();
//! t.as_table().unwrap().borrow_mut().set(TableKey::str("answer"), Value::Number(42.0));
//! // Cycles are fine.
//! t.as_table().unwrap().borrow_mut().set(TableKey::str("me"), t.clone());
//!
//! let bytes = encode_to_vec(&t, &EncodeOptions::default()).unwrap();
//! let out = decode_from_slice(&bytes, &DecodeOptions::default()).unwrap();
//!
//! let me = out.as_table().unwrap().borrow().get(&TableKey::str("me")).unwrap();
//! assert_eq!(me.identity(), out.identity());
//! ```
//!
//! # Layers
//!
//! - [`value`]: the runtime value model the host hands in and gets back.
//! - [`ser`] / [`de`]: value graph to reference table and back. The
//!   serializer dedups by object identity; the deserializer allocates every
//!   container before populating any, so cycles reconnect.
//! - [`hooks`]: pluggable encoders for host-defined object kinds.
//! - [`envelope`]: the versioned, compressed, optionally chunked container
//!   around the binary payload.

pub mod de;
pub mod envelope;
pub mod error;
pub mod hooks;
pub mod runtime;
pub mod ser;
pub mod tensor;
pub mod value;
pub mod varint;
pub mod wire;

pub use de::{deserialize_root, CodePolicy, Deserializer};
pub use envelope::{
    decode_from, decode_from_slice, encode_to, encode_to_vec, Codec, DecodeOptions,
    EncodeOptions, Header, DEFAULT_MAX_PAYLOAD_LEN, MAGIC, MAX_FORMAT_VERSION,
};
pub use error::{Error, Result};
pub use hooks::{global_registry, register_hook, Hook, HookEncode, HookRegistry, MetatableMode};
pub use runtime::VersionInfo;
pub use ser::{serialize_root, Serializer, INLINE_STR_MAX};
pub use tensor::{DType, Storage, Tensor};
pub use value::{Function, ObjectId, Table, TableKey, UserData, Value};
pub use wire::{Primitive, RefTable, RefValue};
