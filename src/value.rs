//! Runtime value model
//!
//! The tagged-variant representation of every value the engine can move in
//! and out of the wire format. Reference kinds (tables, functions, tensors,
//! storages, userdata, byte strings) are shared `Rc` allocations: sharing and
//! cycles in a value graph are expressed directly through `Rc` aliasing, and
//! the serializer keys its deduplication on allocation identity.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::tensor::{Storage, Tensor};

/// A runtime value supplied to `serialize` or produced by `deserialize`.
#[derive(Clone)]
pub enum Value {
    Nil,
    Number(f64),
    Bool(bool),
    /// Byte string. Compared by content when used as a table key.
    Str(Rc<[u8]>),
    Table(Rc<RefCell<Table>>),
    Function(Rc<RefCell<Function>>),
    Tensor(Rc<RefCell<Tensor>>),
    Storage(Rc<RefCell<Storage>>),
    UserData(Rc<RefCell<UserData>>),
}

/// Identity of a reference-kind value: the address of its shared allocation.
///
/// Two values with equal `ObjectId`s alias the same underlying object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

impl Value {
    /// Create an empty table value.
    pub fn table() -> Self {
        Value::Table(Rc::new(RefCell::new(Table::new())))
    }

    /// Create a byte-string value.
    pub fn str(s: impl AsRef<[u8]>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    /// Create a function value from a compiled code blob and captured values.
    pub fn function(code: Vec<u8>, upvalues: Vec<Value>) -> Self {
        Value::Function(Rc::new(RefCell::new(Function { code, upvalues })))
    }

    /// The identity of this value, if it is a reference kind.
    pub fn identity(&self) -> Option<ObjectId> {
        match self {
            Value::Nil | Value::Number(_) | Value::Bool(_) => None,
            Value::Str(rc) => Some(ObjectId(Rc::as_ptr(rc) as *const u8 as usize)),
            Value::Table(rc) => Some(ObjectId(Rc::as_ptr(rc) as usize)),
            Value::Function(rc) => Some(ObjectId(Rc::as_ptr(rc) as usize)),
            Value::Tensor(rc) => Some(ObjectId(Rc::as_ptr(rc) as usize)),
            Value::Storage(rc) => Some(ObjectId(Rc::as_ptr(rc) as usize)),
            Value::UserData(rc) => Some(ObjectId(Rc::as_ptr(rc) as usize)),
        }
    }

    /// Name of this value's kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Tensor(_) => "tensor",
            Value::Storage(_) => "storage",
            Value::UserData(_) => "userdata",
        }
    }

    /// Borrow the table handle, if this is a table.
    pub fn as_table(&self) -> Option<&Rc<RefCell<Table>>> {
        match self {
            Value::Table(rc) => Some(rc),
            _ => None,
        }
    }

    /// Borrow the string bytes, if this is a string.
    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::Str(rc) => Some(rc),
            _ => None,
        }
    }

    /// The numeric value, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Structural equality, ignoring identity.
    ///
    /// Aliased sub-objects short-circuit through identity, but distinct
    /// cyclic graphs will not terminate; intended for acyclic comparisons
    /// (cycles are asserted through [`Value::identity`] instead). Object-kind
    /// table keys only match when they alias.
    pub fn structural_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.identity(), other.identity()) {
            if a == b {
                return true;
            }
        }
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                if a.len() != b.len() {
                    return false;
                }
                let meta_eq = match (&a.metatable, &b.metatable) {
                    (None, None) => true,
                    (Some(x), Some(y)) => x.structural_eq(y),
                    _ => false,
                };
                meta_eq
                    && a.iter().all(|(k, v)| {
                        b.get(k).map_or(false, |other_v| v.structural_eq(&other_v))
                    })
            }
            (Value::Function(a), Value::Function(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.code == b.code
                    && a.upvalues.len() == b.upvalues.len()
                    && a.upvalues
                        .iter()
                        .zip(b.upvalues.iter())
                        .all(|(x, y)| x.structural_eq(y))
            }
            (Value::Tensor(a), Value::Tensor(b)) => *a.borrow() == *b.borrow(),
            (Value::Storage(a), Value::Storage(b)) => *a.borrow() == *b.borrow(),
            (Value::UserData(a), Value::UserData(b)) => {
                a.borrow().type_key == b.borrow().type_key
            }
            _ => false,
        }
    }
}

// Shallow debug output: printing table contents would not terminate on
// cyclic graphs.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            other => {
                let id = other.identity().map(|ObjectId(p)| p).unwrap_or(0);
                write!(f, "<{}@{:#x}>", other.kind_name(), id)
            }
        }
    }
}

/// A table key, classified by kind.
///
/// The key space is partitioned: integral numbers normalize to `Int`,
/// non-integral finite numbers stay `Num`, strings compare by content, and
/// reference kinds compare by identity.
#[derive(Clone)]
pub enum TableKey {
    Int(i64),
    /// Non-integral finite number, compared by bit pattern.
    Num(f64),
    Bool(bool),
    Str(Rc<[u8]>),
    /// Reference-kind key, compared by allocation identity.
    Obj(Value),
}

impl TableKey {
    /// Classify a value as a table key.
    ///
    /// `nil` and NaN are not valid keys and fail with `UnsupportedType`.
    pub fn from_value(value: &Value) -> Result<TableKey> {
        match value {
            Value::Nil => Err(Error::unsupported("nil is not a valid table key")),
            Value::Number(n) => {
                if n.is_nan() {
                    return Err(Error::unsupported("NaN is not a valid table key"));
                }
                let as_int = *n as i64;
                if as_int as f64 == *n {
                    Ok(TableKey::Int(as_int))
                } else {
                    Ok(TableKey::Num(*n))
                }
            }
            Value::Bool(b) => Ok(TableKey::Bool(*b)),
            Value::Str(s) => Ok(TableKey::Str(s.clone())),
            other => Ok(TableKey::Obj(other.clone())),
        }
    }

    /// The key as a plain value.
    pub fn to_value(&self) -> Value {
        match self {
            TableKey::Int(i) => Value::Number(*i as f64),
            TableKey::Num(n) => Value::Number(*n),
            TableKey::Bool(b) => Value::Bool(*b),
            TableKey::Str(s) => Value::Str(s.clone()),
            TableKey::Obj(v) => v.clone(),
        }
    }

    /// Convenience constructor for an integer key.
    pub fn int(i: i64) -> TableKey {
        TableKey::Int(i)
    }

    /// Convenience constructor for a string key.
    pub fn str(s: impl AsRef<[u8]>) -> TableKey {
        TableKey::Str(Rc::from(s.as_ref()))
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TableKey::Int(a), TableKey::Int(b)) => a == b,
            (TableKey::Num(a), TableKey::Num(b)) => a.to_bits() == b.to_bits(),
            (TableKey::Bool(a), TableKey::Bool(b)) => a == b,
            (TableKey::Str(a), TableKey::Str(b)) => a == b,
            (TableKey::Obj(a), TableKey::Obj(b)) => a.identity() == b.identity(),
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TableKey::Int(i) => {
                state.write_u8(0);
                i.hash(state);
            }
            TableKey::Num(n) => {
                state.write_u8(1);
                n.to_bits().hash(state);
            }
            TableKey::Bool(b) => {
                state.write_u8(2);
                b.hash(state);
            }
            TableKey::Str(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            TableKey::Obj(v) => {
                state.write_u8(4);
                v.identity().hash(state);
            }
        }
    }
}

impl fmt::Debug for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKey::Int(i) => write!(f, "[{i}]"),
            TableKey::Num(n) => write!(f, "[{n}]"),
            TableKey::Bool(b) => write!(f, "[{b}]"),
            TableKey::Str(s) => write!(f, "[{:?}]", String::from_utf8_lossy(s)),
            TableKey::Obj(v) => write!(f, "[{v:?}]"),
        }
    }
}

/// An associative table with an arbitrary key space and optional metatable.
#[derive(Default)]
pub struct Table {
    map: FxHashMap<TableKey, Value>,
    /// Optional metatable attached to this table (usually its "class").
    pub metatable: Option<Value>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key. Returns `None` for absent keys.
    pub fn get(&self, key: &TableKey) -> Option<Value> {
        self.map.get(key).cloned()
    }

    /// Look up a positive integer key.
    pub fn get_int(&self, i: i64) -> Option<Value> {
        self.map.get(&TableKey::Int(i)).cloned()
    }

    /// Set a key. Setting `nil` removes the entry.
    pub fn set(&mut self, key: TableKey, value: Value) {
        if matches!(value, Value::Nil) {
            self.map.remove(&key);
        } else {
            self.map.insert(key, value);
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over all entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&TableKey, &Value)> {
        self.map.iter()
    }

    /// Length of the contiguous list part (integer keys 1..=n).
    pub fn list_len(&self) -> i64 {
        let mut n = 0i64;
        while self.map.contains_key(&TableKey::Int(n + 1)) {
            n += 1;
        }
        n
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({} entries)", self.map.len())
    }
}

/// A function value: an opaque compiled code blob plus the values captured
/// at definition time.
#[derive(Debug, Clone, Default)]
pub struct Function {
    /// Compiled-form blob, owned by the host runtime. Opaque to this crate.
    pub code: Vec<u8>,
    /// Captured variables, in capture order.
    pub upvalues: Vec<Value>,
}

/// A host-defined object of a kind this crate has no knowledge of.
///
/// Serialization of userdata is entirely hook-driven: a registered hook
/// turns `data` into an opaque byte payload, and rebuilds it at decode time.
pub struct UserData {
    /// The hook key this object serializes under.
    pub type_key: String,
    /// Host payload. The shell allocated during deserialization holds `()`
    /// until the hook's `decode` replaces it.
    pub data: Box<dyn std::any::Any>,
}

impl UserData {
    /// Create a userdata object with the given hook key and payload.
    pub fn new(type_key: impl Into<String>, data: Box<dyn std::any::Any>) -> Self {
        Self {
            type_key: type_key.into(),
            data,
        }
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({:?})", self.type_key)
    }
}
