//! Wire-level data model
//!
//! What the envelope payload actually encodes: a root [`Primitive`] plus a
//! [`RefTable`] of reference-kind entries. A `Primitive::Ref(i)` is an index
//! into the table, never an inline copy — this is the only way sharing and
//! cycles appear on the wire.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tensor::DType;

/// An inline-encodable value, or an index into the reference table.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Nil,
    Number(f64),
    Bool(bool),
    /// Small string, encoded inline.
    Str(Vec<u8>),
    /// Index into the reference table.
    Ref(i64),
}

/// A table as encoded on the wire, with its key space partitioned by kind.
///
/// Every key of the runtime table lands in exactly one partition. Int and
/// string partitions are ordered maps so the encoded bytes are deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireTable {
    /// Values at contiguous integer keys 1..=n.
    pub list: Vec<Primitive>,
    /// Integer keys outside the list part.
    pub int_keys: BTreeMap<i64, Primitive>,
    /// String keys.
    pub string_keys: BTreeMap<Vec<u8>, Primitive>,
    /// Value at key `true`, if any.
    pub true_key: Option<Primitive>,
    /// Value at key `false`, if any.
    pub false_key: Option<Primitive>,
    /// Keys of any other kind (non-integral numbers, reference kinds).
    pub other_keys: Vec<(Primitive, Primitive)>,
    /// Serialized metatable, if any.
    pub metatable: Option<Primitive>,
    /// Hook key that encoded this table, if a hook overrode it.
    pub special_key: Option<Primitive>,
    /// Hook-produced identity value, passed back to the hook at decode time.
    pub special_value: Option<Primitive>,
}

impl WireTable {
    /// Whether any version-1 field (metatable / special tag) is present.
    pub fn has_extended_fields(&self) -> bool {
        self.metatable.is_some() || self.special_key.is_some() || self.special_value.is_some()
    }
}

/// A reference-kind entry in the reference table.
#[derive(Debug, Clone, PartialEq)]
pub enum RefValue {
    /// A string large enough to warrant ref-table deduplication.
    Str(Vec<u8>),
    Table(WireTable),
    /// A closure: opaque compiled code plus captured values.
    Function { code: Vec<u8>, upvalues: Vec<Primitive> },
    Tensor {
        dtype: DType,
        shape: Vec<i64>,
        data: Vec<u8>,
    },
    Storage {
        dtype: DType,
        data: Vec<u8>,
    },
    /// A slot in an external environment, re-resolved at decode time rather
    /// than reconstructed. Both fields are encoded with references disallowed.
    EnvLocation { env: Primitive, key: Primitive },
    /// Opaque payload for a host-defined object kind, keyed by hook.
    UserData { type_key: String, payload: Vec<u8> },
}

impl RefValue {
    /// Name of this entry's kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RefValue::Str(_) => "string",
            RefValue::Table(_) => "table",
            RefValue::Function { .. } => "function",
            RefValue::Tensor { .. } => "tensor",
            RefValue::Storage { .. } => "storage",
            RefValue::EnvLocation { .. } => "env-location",
            RefValue::UserData { .. } => "userdata",
        }
    }
}

/// Append-only, index-addressed store of reference-kind entries for one
/// serialize/deserialize call. Indices are zero-based.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefTable {
    entries: Vec<RefValue>,
}

impl RefTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries.
    pub fn from_entries(entries: Vec<RefValue>) -> Self {
        Self { entries }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry, returning its index.
    pub fn push(&mut self, entry: RefValue) -> i64 {
        let index = self.entries.len() as i64;
        self.entries.push(entry);
        index
    }

    /// Look up an entry, failing with `InvalidRef` for out-of-range indices.
    pub fn get(&self, index: i64) -> Result<&RefValue> {
        if index < 0 {
            return Err(Error::InvalidRef {
                index,
                table_size: self.entries.len(),
            });
        }
        self.entries
            .get(index as usize)
            .ok_or(Error::InvalidRef {
                index,
                table_size: self.entries.len(),
            })
    }

    /// Iterate over entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = &RefValue> {
        self.entries.iter()
    }
}
