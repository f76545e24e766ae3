//! Deserializer: two-phase reconstruction of a value graph from a reference
//! table.
//!
//! Phase one allocates a container for every reference entry, so any `Ref`
//! index can be resolved to a live value before anything is filled in. Phase
//! two populates table contents and function upvalues, then runs hook
//! decoders. Cycles come out of this for free: by the time a table body is
//! populated, every object it can point at already exists.

use tracing::trace;

use crate::error::{Error, Result};
use crate::hooks::HookRegistry;
use crate::tensor::{Storage, Tensor};
use crate::value::{Table, TableKey, UserData, Value};
use crate::wire::{Primitive, RefTable, RefValue, WireTable};

/// Whether function code blobs may be materialized.
#[derive(Debug, Clone)]
pub enum CodePolicy {
    /// Decode functions normally.
    Allow,
    /// The caller opted out of code loading; any function entry fails.
    Skip,
    /// The envelope was produced by an incompatible code format; any
    /// function entry fails with the recorded fingerprints.
    Mismatch { envelope: String, runtime: String },
}

/// Rebuilds values from a reference table.
///
/// One deserializer prepares the table once and can then resolve any number
/// of root primitives against it, mirroring the serializer's multi-object
/// contract.
pub struct Deserializer<'a> {
    refs: &'a RefTable,
    registry: HookRegistry,
    converted: Vec<Option<Value>>,
    env: Option<Value>,
    code_policy: CodePolicy,
    prepared: bool,
}

impl<'a> Deserializer<'a> {
    /// Create a deserializer over a reference table.
    pub fn new(refs: &'a RefTable, registry: HookRegistry) -> Self {
        Self {
            refs,
            registry,
            converted: vec![None; refs.len()],
            env: None,
            code_policy: CodePolicy::Allow,
            prepared: false,
        }
    }

    /// Provide the environment table that env-location entries resolve
    /// against.
    pub fn set_env(&mut self, env: Value) {
        self.env = Some(env);
    }

    /// Set the function-code policy.
    pub fn set_code_policy(&mut self, policy: CodePolicy) {
        self.code_policy = policy;
    }

    /// Rebuild the value a root primitive refers to.
    pub fn deserialize(&mut self, root: &Primitive) -> Result<Value> {
        if !self.prepared {
            self.allocate_all()?;
            self.populate_all()?;
            self.run_special_hooks()?;
            self.prepared = true;
        }
        self.resolve(root)
    }

    fn resolve(&self, primitive: &Primitive) -> Result<Value> {
        match primitive {
            Primitive::Nil => Ok(Value::Nil),
            Primitive::Number(n) => Ok(Value::Number(*n)),
            Primitive::Bool(b) => Ok(Value::Bool(*b)),
            Primitive::Str(s) => Ok(Value::str(s)),
            Primitive::Ref(index) => {
                self.refs.get(*index)?;
                self.converted[*index as usize].clone().ok_or_else(|| {
                    Error::malformed(format!("reference {index} resolved before allocation"))
                })
            }
        }
    }

    fn allocate_all(&mut self) -> Result<()> {
        for index in 0..self.refs.len() {
            let entry = self.refs.get(index as i64)?;
            trace!(index, kind = entry.kind_name(), "allocating");
            let value = match entry {
                RefValue::Str(s) => Value::str(s),
                RefValue::Table(_) => Value::table(),
                RefValue::Function { code, .. } => self.allocate_function(code)?,
                RefValue::Tensor { dtype, shape, data } => {
                    let tensor = Tensor::new(*dtype, shape.clone(), data.clone())?;
                    Value::Tensor(std::rc::Rc::new(std::cell::RefCell::new(tensor)))
                }
                RefValue::Storage { dtype, data } => {
                    let storage = Storage::new(*dtype, data.clone())?;
                    Value::Storage(std::rc::Rc::new(std::cell::RefCell::new(storage)))
                }
                RefValue::EnvLocation { env, key } => self.resolve_env_location(env, key)?,
                RefValue::UserData { type_key, payload } => {
                    self.allocate_userdata(type_key, payload)?
                }
            };
            self.converted[index] = Some(value);
        }
        Ok(())
    }

    fn allocate_function(&self, code: &[u8]) -> Result<Value> {
        match &self.code_policy {
            CodePolicy::Allow => Ok(Value::function(code.to_vec(), Vec::new())),
            CodePolicy::Skip => Err(Error::unsupported(
                "function entry present but code loading is disabled".to_string(),
            )),
            CodePolicy::Mismatch { envelope, runtime } => Err(Error::FingerprintMismatch {
                envelope: envelope.clone(),
                runtime: runtime.clone(),
            }),
        }
    }

    /// Env locations are not reconstructed: they are looked up in the
    /// caller-provided environment, two levels deep.
    fn resolve_env_location(&self, env: &Primitive, key: &Primitive) -> Result<Value> {
        if matches!(env, Primitive::Ref(_)) || matches!(key, Primitive::Ref(_)) {
            return Err(Error::malformed(
                "env location parts must be inline primitives".to_string(),
            ));
        }
        let env_root = self.env.as_ref().ok_or_else(|| {
            Error::malformed("env location present but no environment was provided".to_string())
        })?;
        let env_root = env_root
            .as_table()
            .ok_or_else(|| Error::malformed("environment must be a table".to_string()))?;

        let env_key = TableKey::from_value(&self.resolve(env)?)?;
        let inner = env_root.borrow().get(&env_key).ok_or_else(|| {
            Error::malformed(format!("env location: no environment {env_key:?}"))
        })?;
        let inner = inner
            .as_table()
            .ok_or_else(|| Error::malformed("env location: environment entry is not a table".to_string()))?
            .clone();

        let value_key = TableKey::from_value(&self.resolve(key)?)?;
        let found = inner.borrow().get(&value_key);
        found.ok_or_else(|| Error::malformed(format!("env location: no value at {value_key:?}")))
    }

    fn allocate_userdata(&self, type_key: &str, payload: &[u8]) -> Result<Value> {
        let hook = self.registry.get(type_key).ok_or_else(|| {
            Error::malformed(format!("no hook registered for userdata key {type_key:?}"))
        })?;
        let shell = Value::UserData(std::rc::Rc::new(std::cell::RefCell::new(UserData::new(
            type_key,
            Box::new(()),
        ))));
        hook.decode(&Value::str(payload), &shell)?;
        Ok(shell)
    }

    fn populate_all(&mut self) -> Result<()> {
        for index in 0..self.refs.len() {
            match self.refs.get(index as i64)? {
                RefValue::Table(wire) => {
                    let target = self.converted[index]
                        .as_ref()
                        .and_then(Value::as_table)
                        .expect("table entry allocated as a table")
                        .clone();
                    self.populate_table(wire, &target)?;
                }
                RefValue::Function { upvalues, .. } => {
                    let target = match self.converted[index].as_ref() {
                        Some(Value::Function(rc)) => rc.clone(),
                        _ => unreachable!("function entry allocated as a function"),
                    };
                    let mut resolved = Vec::with_capacity(upvalues.len());
                    for upvalue in upvalues {
                        resolved.push(self.resolve(upvalue)?);
                    }
                    target.borrow_mut().upvalues = resolved;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn populate_table(
        &self,
        wire: &WireTable,
        target: &std::rc::Rc<std::cell::RefCell<Table>>,
    ) -> Result<()> {
        let mut table = target.borrow_mut();
        for (i, item) in wire.list.iter().enumerate() {
            table.set(TableKey::Int(i as i64 + 1), self.resolve(item)?);
        }
        for (key, value) in &wire.int_keys {
            table.set(TableKey::Int(*key), self.resolve(value)?);
        }
        for (key, value) in &wire.string_keys {
            table.set(TableKey::Str(std::rc::Rc::from(key.as_slice())), self.resolve(value)?);
        }
        if let Some(value) = &wire.true_key {
            table.set(TableKey::Bool(true), self.resolve(value)?);
        }
        if let Some(value) = &wire.false_key {
            table.set(TableKey::Bool(false), self.resolve(value)?);
        }
        for (key, value) in &wire.other_keys {
            let key = TableKey::from_value(&self.resolve(key)?)?;
            table.set(key, self.resolve(value)?);
        }
        if let Some(metatable) = &wire.metatable {
            table.metatable = Some(self.resolve(metatable)?);
        }
        Ok(())
    }

    /// Hook decoders run once per tagged entry, after every table in the
    /// graph is fully populated.
    fn run_special_hooks(&self) -> Result<()> {
        for index in 0..self.refs.len() {
            let RefValue::Table(wire) = self.refs.get(index as i64)? else {
                continue;
            };
            let Some(special_key) = &wire.special_key else {
                continue;
            };
            let Primitive::Str(key_bytes) = special_key else {
                return Err(Error::malformed(
                    "special hook key must be a string".to_string(),
                ));
            };
            let key = String::from_utf8_lossy(key_bytes).into_owned();
            let hook = self
                .registry
                .get(&key)
                .ok_or_else(|| Error::malformed(format!("no hook registered for key {key:?}")))?;
            let id = match &wire.special_value {
                Some(primitive) => self.resolve(primitive)?,
                None => Value::Nil,
            };
            let target = self.converted[index]
                .clone()
                .expect("tagged entry allocated in phase one");
            trace!(index, hook = %key, "running hook decode");
            hook.decode(&id, &target)?;
        }
        Ok(())
    }
}

/// Rebuild a single root value with an explicit registry.
pub fn deserialize_root(
    root: &Primitive,
    refs: &RefTable,
    registry: &HookRegistry,
) -> Result<Value> {
    Deserializer::new(refs, registry.clone()).deserialize(root)
}
