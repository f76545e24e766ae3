//! Hook registry
//!
//! Hooks let callers override the default encoding of custom object kinds:
//! tables tagged as class instances, and userdata objects this crate cannot
//! represent on its own. Each hook is a (match, encode, decode) triple
//! registered under a globally unique key.
//!
//! Matching runs in **registration order** and the first match wins. When
//! more than one hook could match the same value, which one applies depends
//! only on the order they were registered in.

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::value::Value;

/// What a hook does with the matched value's metatable.
pub enum MetatableMode {
    /// Serialize the value's own metatable, if any.
    Keep,
    /// Serialize no metatable (the usual choice: the metatable is the class,
    /// and the decode hook re-attaches it from the id).
    Drop,
    /// Serialize this value instead of the original metatable.
    Replace(Value),
}

/// The wire-side replacement a hook produces for a matched value.
pub enum HookEncode {
    /// Table-kind override: serialize `table` (or the value's own table when
    /// `None`) in place of the original, tag the entry with the hook key,
    /// and carry `id` to the decode side.
    Special {
        id: Value,
        table: Option<Value>,
        metatable: MetatableMode,
    },
    /// Userdata-kind override: an opaque byte payload.
    Payload(Vec<u8>),
}

/// A pluggable encoder/decoder for one host-defined object kind.
pub trait Hook: Send + Sync {
    /// Whether this hook owns the given value. Evaluated against every
    /// table and userdata value before default encoding is attempted.
    fn matches(&self, value: &Value) -> bool;

    /// Produce the wire-side replacement for a matched value.
    fn encode(&self, value: &Value) -> Result<HookEncode>;

    /// Re-attach type identity to a freshly reconstructed container,
    /// mutating it in place.
    ///
    /// For tables, `id` is the value returned from `encode` and `target` is
    /// the fully populated table. For userdata, `id` is the raw payload as a
    /// string value and `target` is an empty userdata shell carrying the
    /// hook key.
    fn decode(&self, id: &Value, target: &Value) -> Result<()>;
}

/// An ordered set of hooks with unique keys.
#[derive(Clone, Default)]
pub struct HookRegistry {
    entries: Vec<(String, Arc<dyn Hook>)>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook under a unique key.
    ///
    /// Fails with [`Error::DuplicateHookKey`] if the key is already taken.
    pub fn register(&mut self, key: impl Into<String>, hook: Arc<dyn Hook>) -> Result<()> {
        let key = key.into();
        if self.entries.iter().any(|(k, _)| *k == key) {
            return Err(Error::DuplicateHookKey(key));
        }
        self.entries.push((key, hook));
        Ok(())
    }

    /// Find the first hook (in registration order) matching the value.
    pub fn find_match(&self, value: &Value) -> Option<(&str, &Arc<dyn Hook>)> {
        self.entries
            .iter()
            .find(|(_, hook)| hook.matches(value))
            .map(|(key, hook)| (key.as_str(), hook))
    }

    /// Look up a hook by its registration key.
    pub fn get(&self, key: &str) -> Option<&Arc<dyn Hook>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, hook)| hook)
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-wide default registry.
///
/// Expected to be populated at startup, before any serialize/deserialize
/// call runs. Serializers and deserializers snapshot the registry at
/// construction, so in-flight calls never observe concurrent registration.
static GLOBAL_REGISTRY: Lazy<RwLock<HookRegistry>> =
    Lazy::new(|| RwLock::new(HookRegistry::new()));

/// Register a hook in the process-wide default registry.
pub fn register_hook(key: impl Into<String>, hook: Arc<dyn Hook>) -> Result<()> {
    let mut registry = GLOBAL_REGISTRY
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.register(key, hook)
}

/// Snapshot the process-wide default registry.
pub fn global_registry() -> HookRegistry {
    GLOBAL_REGISTRY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}
