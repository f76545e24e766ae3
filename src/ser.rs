//! Serializer: one depth-first walk from the root, building the reference
//! table with identity deduplication.
//!
//! Reference-kind values are memoized by allocation identity *before* their
//! children are visited, so self-reference and cycles terminate: the second
//! encounter of an object emits a `Ref` to the index reserved at the first.
//! Entries are filled in postorder, after their children are serialized.

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Error, Result};
use crate::hooks::{HookEncode, HookRegistry, MetatableMode};
use crate::value::{ObjectId, TableKey, Value};
use crate::wire::{Primitive, RefTable, RefValue, WireTable};

/// Strings up to this many bytes encode inline; longer strings go through
/// the reference table and are deduplicated by identity.
pub const INLINE_STR_MAX: usize = 64;

/// Serializes one or more value graphs into a shared reference table.
///
/// Objects serialized by the same serializer (before [`Serializer::finish`])
/// are deduplicated against each other, matching the original multi-object
/// contract: serialize each root, then call `finish` once and ship the
/// resulting table alongside all the root primitives.
pub struct Serializer {
    registry: HookRegistry,
    dedup: FxHashMap<ObjectId, i64>,
    refs: Vec<Option<RefValue>>,
    inverted_env: FxHashMap<ObjectId, (Value, Value)>,
    // Keeps inverted-env key objects alive so their identities stay valid
    // for the lifetime of the dedup map.
    env_keepalive: Vec<Value>,
}

impl Serializer {
    /// Create a serializer using a snapshot of the process-wide registry.
    pub fn new() -> Self {
        Self::with_registry(crate::hooks::global_registry())
    }

    /// Create a serializer with an explicit hook registry.
    pub fn with_registry(registry: HookRegistry) -> Self {
        Self {
            registry,
            dedup: FxHashMap::default(),
            refs: Vec::new(),
            inverted_env: FxHashMap::default(),
            env_keepalive: Vec::new(),
        }
    }

    /// Declare values that must not be serialized, mapping each to the
    /// `(env, key)` location it can be re-resolved from on the other side.
    ///
    /// Both location parts must be primitives (numbers, strings, booleans);
    /// they are encoded with references disallowed.
    pub fn set_inverted_env(
        &mut self,
        entries: impl IntoIterator<Item = (Value, (Value, Value))>,
    ) -> Result<()> {
        for (object, (env, key)) in entries {
            let id = object.identity().ok_or_else(|| {
                Error::unsupported(format!(
                    "inverted env entry must be a reference kind, got {}",
                    object.kind_name()
                ))
            })?;
            self.inverted_env.insert(id, (env, key));
            self.env_keepalive.push(object);
        }
        Ok(())
    }

    /// Serialize one value graph, returning its root primitive.
    pub fn serialize(&mut self, value: &Value) -> Result<Primitive> {
        self.encode_value(value, true)
    }

    /// Consume the serializer and return the accumulated reference table.
    pub fn finish(self) -> Result<RefTable> {
        let mut entries = Vec::with_capacity(self.refs.len());
        for (index, slot) in self.refs.into_iter().enumerate() {
            match slot {
                Some(entry) => entries.push(entry),
                None => {
                    return Err(Error::malformed(format!(
                        "reference {index} was reserved but never filled \
                         (a prior serialize call failed)"
                    )))
                }
            }
        }
        Ok(RefTable::from_entries(entries))
    }

    fn encode_value(&mut self, value: &Value, allow_refs: bool) -> Result<Primitive> {
        match value {
            Value::Nil => Ok(Primitive::Nil),
            Value::Number(n) => Ok(Primitive::Number(*n)),
            Value::Bool(b) => Ok(Primitive::Bool(*b)),
            Value::Str(s) if !allow_refs || s.len() <= INLINE_STR_MAX => {
                Ok(Primitive::Str(s.to_vec()))
            }
            _ => self.encode_reference(value, allow_refs),
        }
    }

    fn encode_reference(&mut self, value: &Value, allow_refs: bool) -> Result<Primitive> {
        if !allow_refs {
            return Err(Error::unsupported(format!(
                "references not allowed here ({})",
                value.kind_name()
            )));
        }

        let id = value
            .identity()
            .expect("reference kinds always have an identity");

        if let Some(&index) = self.dedup.get(&id) {
            trace!(index, "existing reference");
            return Ok(Primitive::Ref(index));
        }

        // Reserve the index and record it before recursing into children;
        // this is what makes self-reference and cycles terminate.
        let index = self.refs.len() as i64;
        self.refs.push(None);
        self.dedup.insert(id, index);
        trace!(index, kind = value.kind_name(), "new reference");

        if let Some((env, key)) = self.inverted_env.get(&id).cloned() {
            trace!(index, "external env value");
            let env = self.encode_value(&env, false)?;
            let key = self.encode_value(&key, false)?;
            self.refs[index as usize] = Some(RefValue::EnvLocation { env, key });
            return Ok(Primitive::Ref(index));
        }

        let entry = match value {
            Value::Str(s) => RefValue::Str(s.to_vec()),
            Value::Table(_) => RefValue::Table(self.encode_table(value)?),
            Value::Function(rc) => {
                let (code, upvalues) = {
                    let f = rc.borrow();
                    (f.code.clone(), f.upvalues.clone())
                };
                if code.is_empty() {
                    return Err(Error::unsupported(
                        "function has no serializable code blob".to_string(),
                    ));
                }
                let upvalues = upvalues
                    .iter()
                    .map(|v| self.encode_value(v, true))
                    .collect::<Result<Vec<_>>>()?;
                RefValue::Function { code, upvalues }
            }
            Value::Tensor(rc) => {
                let t = rc.borrow();
                RefValue::Tensor {
                    dtype: t.dtype,
                    shape: t.shape.clone(),
                    data: t.data.clone(),
                }
            }
            Value::Storage(rc) => {
                let s = rc.borrow();
                RefValue::Storage {
                    dtype: s.dtype,
                    data: s.data.clone(),
                }
            }
            Value::UserData(_) => self.encode_userdata(value)?,
            _ => unreachable!("primitive kinds are handled by encode_value"),
        };

        self.refs[index as usize] = Some(entry);
        Ok(Primitive::Ref(index))
    }

    fn encode_table(&mut self, value: &Value) -> Result<WireTable> {
        let rc = value.as_table().expect("caller matched a table");
        let mut out = WireTable::default();

        // The value's own metatable is the default; a hook may drop or
        // replace it.
        let mut metatable = rc.borrow().metatable.clone();
        let mut source = rc.clone();

        let matched = self
            .registry
            .find_match(value)
            .map(|(k, h)| (k.to_string(), h.clone()));
        if let Some((key, hook)) = matched {
            trace!(hook = %key, "table matched hook");
            match hook.encode(value)? {
                HookEncode::Special { id, table, metatable: mode } => {
                    out.special_key = Some(Primitive::Str(key.into_bytes()));
                    out.special_value = Some(self.encode_value(&id, true)?);
                    if let Some(replacement) = table {
                        source = replacement
                            .as_table()
                            .ok_or_else(|| {
                                Error::unsupported(format!(
                                    "hook replacement must be a table, got {}",
                                    replacement.kind_name()
                                ))
                            })?
                            .clone();
                    }
                    match mode {
                        MetatableMode::Keep => {}
                        MetatableMode::Drop => metatable = None,
                        MetatableMode::Replace(v) => metatable = Some(v),
                    }
                }
                HookEncode::Payload(_) => {
                    return Err(Error::unsupported(
                        "payload hook applied to a table value".to_string(),
                    ))
                }
            }
        }

        // Partition the key space. Entries are cloned out first so the
        // table borrow is not held across recursion, and non-list keys are
        // sorted so the wire bytes are deterministic.
        let list_len;
        let mut int_keys = Vec::new();
        let mut string_keys = Vec::new();
        let mut true_val = None;
        let mut false_val = None;
        let mut num_keys = Vec::new();
        let mut obj_keys = Vec::new();
        {
            let table = source.borrow();
            list_len = table.list_len();
            for (key, val) in table.iter() {
                match key {
                    TableKey::Int(i) if *i >= 1 && *i <= list_len => {}
                    TableKey::Int(i) => int_keys.push((*i, val.clone())),
                    TableKey::Str(s) => string_keys.push((s.to_vec(), val.clone())),
                    TableKey::Bool(true) => true_val = Some(val.clone()),
                    TableKey::Bool(false) => false_val = Some(val.clone()),
                    TableKey::Num(n) => num_keys.push((*n, val.clone())),
                    TableKey::Obj(k) => obj_keys.push((k.clone(), val.clone())),
                }
            }
        }
        int_keys.sort_by_key(|(i, _)| *i);
        string_keys.sort_by(|(a, _), (b, _)| a.cmp(b));
        num_keys.sort_by(|(a, _), (b, _)| a.total_cmp(b));

        for i in 1..=list_len {
            let item = source.borrow().get_int(i).expect("within list part");
            out.list.push(self.encode_value(&item, true)?);
        }
        for (i, val) in int_keys {
            let encoded = self.encode_value(&val, true)?;
            out.int_keys.insert(i, encoded);
        }
        for (key, val) in string_keys {
            let encoded = self.encode_value(&val, true)?;
            out.string_keys.insert(key, encoded);
        }
        if let Some(val) = true_val {
            out.true_key = Some(self.encode_value(&val, true)?);
        }
        if let Some(val) = false_val {
            out.false_key = Some(self.encode_value(&val, true)?);
        }
        for (n, val) in num_keys {
            let v = self.encode_value(&val, true)?;
            out.other_keys.push((Primitive::Number(n), v));
        }
        for (key, val) in obj_keys {
            let k = self.encode_value(&key, true)?;
            let v = self.encode_value(&val, true)?;
            out.other_keys.push((k, v));
        }
        if let Some(meta) = metatable {
            out.metatable = Some(self.encode_value(&meta, true)?);
        }

        Ok(out)
    }

    fn encode_userdata(&mut self, value: &Value) -> Result<RefValue> {
        let Some((key, hook)) = self.registry.find_match(value) else {
            let type_key = match value {
                Value::UserData(rc) => rc.borrow().type_key.clone(),
                _ => unreachable!(),
            };
            return Err(Error::unsupported(format!(
                "userdata {type_key:?} has no registered hook"
            )));
        };
        match hook.encode(value)? {
            HookEncode::Payload(payload) => Ok(RefValue::UserData {
                type_key: key.to_string(),
                payload,
            }),
            HookEncode::Special { .. } => Err(Error::unsupported(
                "special hook applied to a userdata value".to_string(),
            )),
        }
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a single root value with an explicit registry.
pub fn serialize_root(value: &Value, registry: &HookRegistry) -> Result<(Primitive, RefTable)> {
    let mut serializer = Serializer::with_registry(registry.clone());
    let root = serializer.serialize(value)?;
    Ok((root, serializer.finish()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TableKey;

    fn serialize(value: &Value) -> (Primitive, RefTable) {
        serialize_root(value, &HookRegistry::new()).unwrap()
    }

    #[test]
    fn test_primitives_inline() {
        assert_eq!(serialize(&Value::Nil).0, Primitive::Nil);
        assert_eq!(serialize(&Value::Number(1.5)).0, Primitive::Number(1.5));
        assert_eq!(serialize(&Value::Bool(true)).0, Primitive::Bool(true));
        assert!(serialize(&Value::Nil).1.is_empty());
    }

    #[test]
    fn test_short_string_inline_long_string_reffed() {
        let short = Value::str("hi");
        let (root, refs) = serialize(&short);
        assert_eq!(root, Primitive::Str(b"hi".to_vec()));
        assert!(refs.is_empty());

        let long = Value::str(vec![b'x'; INLINE_STR_MAX + 1]);
        let (root, refs) = serialize(&long);
        assert_eq!(root, Primitive::Ref(0));
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_list_partition() {
        let t = Value::table();
        {
            let mut table = t.as_table().unwrap().borrow_mut();
            for i in 1..=3 {
                table.set(TableKey::int(i), Value::Number(i as f64));
            }
        }
        let (root, refs) = serialize(&t);
        assert_eq!(root, Primitive::Ref(0));
        match refs.get(0).unwrap() {
            RefValue::Table(wt) => {
                assert_eq!(wt.list.len(), 3);
                assert!(wt.int_keys.is_empty());
            }
            other => panic!("expected table, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_shared_subobject_dedup() {
        let shared = Value::table();
        let outer = Value::table();
        {
            let mut table = outer.as_table().unwrap().borrow_mut();
            table.set(TableKey::str("a"), shared.clone());
            table.set(TableKey::str("b"), shared.clone());
        }
        let (_, refs) = serialize(&outer);
        // outer + shared, not outer + shared twice
        assert_eq!(refs.len(), 2);
        match refs.get(0).unwrap() {
            RefValue::Table(wt) => {
                assert_eq!(wt.string_keys[&b"a".to_vec()], wt.string_keys[&b"b".to_vec()]);
            }
            _ => panic!("expected table"),
        }
    }

    #[test]
    fn test_self_reference_terminates() {
        let t = Value::table();
        t.as_table()
            .unwrap()
            .borrow_mut()
            .set(TableKey::str("self"), t.clone());
        let (root, refs) = serialize(&t);
        assert_eq!(root, Primitive::Ref(0));
        assert_eq!(refs.len(), 1);
        match refs.get(0).unwrap() {
            RefValue::Table(wt) => {
                assert_eq!(wt.string_keys[&b"self".to_vec()], Primitive::Ref(0));
            }
            _ => panic!("expected table"),
        }
    }

    #[test]
    fn test_userdata_without_hook_fails() {
        let ud = Value::UserData(std::rc::Rc::new(std::cell::RefCell::new(
            crate::value::UserData::new("mystery", Box::new(())),
        )));
        let err = serialize_root(&ud, &HookRegistry::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[test]
    fn test_inverted_env() {
        let module = Value::table();
        let outer = Value::table();
        outer
            .as_table()
            .unwrap()
            .borrow_mut()
            .set(TableKey::str("io"), module.clone());

        let mut serializer = Serializer::with_registry(HookRegistry::new());
        serializer
            .set_inverted_env([(
                module,
                (Value::Number(1.0), Value::str("io")),
            )])
            .unwrap();
        let root = serializer.serialize(&outer).unwrap();
        let refs = serializer.finish().unwrap();

        assert_eq!(root, Primitive::Ref(0));
        assert_eq!(refs.len(), 2);
        match refs.get(1).unwrap() {
            RefValue::EnvLocation { env, key } => {
                assert_eq!(*env, Primitive::Number(1.0));
                assert_eq!(*key, Primitive::Str(b"io".to_vec()));
            }
            other => panic!("expected env location, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_function_upvalues() {
        let shared = Value::table();
        let f = Value::function(vec![0xDE, 0xAD], vec![shared.clone(), shared]);
        let (root, refs) = serialize(&f);
        assert_eq!(root, Primitive::Ref(0));
        match refs.get(0).unwrap() {
            RefValue::Function { code, upvalues } => {
                assert_eq!(code, &[0xDE, 0xAD]);
                assert_eq!(upvalues[0], upvalues[1]);
            }
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_codeless_function_fails() {
        let f = Value::function(Vec::new(), Vec::new());
        let err = serialize_root(&f, &HookRegistry::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }
}
