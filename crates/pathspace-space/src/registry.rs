//! Process-wide type registry and the typed payload bridge.
//!
//! The registry maps stable type names (and [`TypeId`]s) to descriptors
//! bundling erased construct/serialize/deserialize operations plus erased
//! insert/take against a [`PathSpace`]. Both mount endpoints must share a
//! registry entry for a type to travel: wire payloads carry only the type
//! name, and decoding fails with `InvalidType` when the receiver does not
//! know it.
//!
//! Registration is idempotent: a duplicate name or duplicate type never
//! overwrites an existing entry. Built-in scalars and `String` are
//! registered eagerly on first access of [`TypeRegistry::global`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use pathspace_types::{Error, Expected};

use crate::codec;
use crate::space::{InsertReturn, OutOptions, PathSpace};
use crate::{type_name_of, PathValue};

type ErasedValue = Box<dyn Any + Send>;

/// Erased operations for one registered type.
pub struct TypeDescriptor {
    type_name: String,
    type_id: TypeId,
    construct: fn() -> ErasedValue,
    serialize: fn(&dyn Any) -> Expected<Vec<u8>>,
    deserialize: fn(&[u8]) -> Expected<ErasedValue>,
    insert: fn(&PathSpace, &str, ErasedValue) -> Expected<InsertReturn>,
    take: fn(&PathSpace, &str, &OutOptions) -> Expected<ErasedValue>,
}

impl TypeDescriptor {
    /// Stable registry name of the type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Opaque platform type identity.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, Arc<TypeDescriptor>>,
    by_type: HashMap<TypeId, Arc<TypeDescriptor>>,
}

/// Process-wide `TypeName -> TypeDescriptor` table.
#[derive(Default)]
pub struct TypeRegistry {
    state: Mutex<RegistryState>,
}

impl TypeRegistry {
    /// The process-wide instance, with built-in scalar types and `String`
    /// registered on first access.
    pub fn global() -> &'static TypeRegistry {
        static INSTANCE: OnceLock<TypeRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let registry = TypeRegistry::default();
            registry.register_builtins();
            registry
        })
    }

    /// Create an empty registry (tests and embedders).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `name_override`, or its default stable name.
    ///
    /// Returns `false` without overwriting when either the name or the type
    /// is already registered.
    pub fn register<T: PathValue + Default>(&self, name_override: Option<&str>) -> bool {
        let resolved = match name_override {
            Some(name) if !name.is_empty() => name.to_string(),
            Some(_) => return false,
            None => type_name_of::<T>().to_string(),
        };
        let descriptor = Arc::new(TypeDescriptor {
            type_name: resolved.clone(),
            type_id: TypeId::of::<T>(),
            construct: construct_value::<T>,
            serialize: serialize_erased::<T>,
            deserialize: deserialize_erased::<T>,
            insert: insert_erased::<T>,
            take: take_erased::<T>,
        });
        let mut state = self.lock();
        if state.by_name.contains_key(&resolved) || state.by_type.contains_key(&TypeId::of::<T>())
        {
            return false;
        }
        state.by_name.insert(resolved, Arc::clone(&descriptor));
        state.by_type.insert(TypeId::of::<T>(), descriptor);
        true
    }

    /// Look up a descriptor by its stable name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.lock().by_name.get(name).cloned()
    }

    /// Look up a descriptor by platform type identity.
    pub fn find_by_type(&self, type_id: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.lock().by_type.get(&type_id).cloned()
    }

    fn register_builtins(&self) {
        self.register::<bool>(None);
        self.register::<i32>(None);
        self.register::<u32>(None);
        self.register::<i64>(None);
        self.register::<u64>(None);
        self.register::<f32>(None);
        self.register::<f64>(None);
        self.register::<String>(None);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn construct_value<T: Default + Send + 'static>() -> ErasedValue {
    Box::new(T::default())
}

fn serialize_erased<T: PathValue>(value: &dyn Any) -> Expected<Vec<u8>> {
    let value = value
        .downcast_ref::<T>()
        .ok_or_else(|| Error::InvalidType("value does not match descriptor type".into()))?;
    codec::serialize_value(value)
}

fn deserialize_erased<T: PathValue>(bytes: &[u8]) -> Expected<ErasedValue> {
    let value: T = codec::deserialize_value(bytes)?;
    Ok(Box::new(value))
}

fn insert_erased<T: PathValue>(
    space: &PathSpace,
    path: &str,
    value: ErasedValue,
) -> Expected<InsertReturn> {
    let value = value
        .downcast::<T>()
        .map_err(|_| Error::InvalidType("value does not match descriptor type".into()))?;
    Ok(space.insert::<T>(path, &value))
}

fn take_erased<T: PathValue>(
    space: &PathSpace,
    path: &str,
    options: &OutOptions,
) -> Expected<ErasedValue> {
    let value: T = space.take(path, options)?;
    Ok(Box::new(value))
}

// ---------------------------------------------------------------------------
// Payload bridge
// ---------------------------------------------------------------------------

/// Decode `bytes` as the named type and insert the value at `path`.
///
/// A zero-length payload inserts a default-constructed value; anything else
/// must decode cleanly or the insert fails with `InvalidType`.
pub fn insert_typed_bytes(
    space: &PathSpace,
    path: &str,
    type_name: &str,
    bytes: &[u8],
) -> Expected<InsertReturn> {
    let descriptor = require_type(type_name)?;
    let value = if bytes.is_empty() {
        (descriptor.construct)()
    } else {
        (descriptor.deserialize)(bytes)
            .map_err(|e| Error::InvalidType(format!("typed payload decode failed: {e}")))?
    };
    (descriptor.insert)(space, path, value)
}

/// Take the front value of the named type at `path` and encode it.
///
/// `NoObjectFound` / `NoSuchPath` / `Timeout` from the space propagate
/// unchanged; the take loop on the server treats the first two as
/// exhaustion.
pub fn take_typed_bytes(
    space: &PathSpace,
    path: &str,
    type_name: &str,
    options: &OutOptions,
) -> Expected<Vec<u8>> {
    let descriptor = require_type(type_name)?;
    let value = (descriptor.take)(space, path, options)?;
    (descriptor.serialize)(value.as_ref())
        .map_err(|e| Error::InvalidType(format!("typed payload encode failed: {e}")))
}

fn require_type(type_name: &str) -> Expected<Arc<TypeDescriptor>> {
    if type_name.is_empty() {
        return Err(Error::InvalidType("type name is required".into()));
    }
    TypeRegistry::global()
        .find_by_name(type_name)
        .ok_or_else(|| Error::InvalidType(format!("unregistered type {type_name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        label: String,
        count: u32,
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TypeRegistry::global();
        for name in [
            type_name_of::<bool>(),
            type_name_of::<i64>(),
            type_name_of::<u64>(),
            type_name_of::<f64>(),
            type_name_of::<String>(),
        ] {
            assert!(registry.find_by_name(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = TypeRegistry::new();
        assert!(registry.register::<Sample>(Some("sample")));
        assert!(!registry.register::<Sample>(Some("sample")));
        // Same type under a fresh name is also refused.
        assert!(!registry.register::<Sample>(Some("sample-2")));
        // Same name for a different type is refused.
        assert!(!registry.register::<u8>(Some("sample")));
        assert!(registry.find_by_name("sample-2").is_none());
    }

    #[test]
    fn test_empty_override_rejected() {
        let registry = TypeRegistry::new();
        assert!(!registry.register::<Sample>(Some("")));
    }

    #[test]
    fn test_find_by_type() {
        let registry = TypeRegistry::new();
        registry.register::<Sample>(None);
        let descriptor = registry
            .find_by_type(TypeId::of::<Sample>())
            .expect("descriptor");
        assert_eq!(descriptor.type_name(), type_name_of::<Sample>());
    }

    #[test]
    fn test_bridge_insert_take_roundtrip() {
        let space = PathSpace::new();
        let value = "bridged".to_string();
        let bytes = codec::serialize_value(&value).expect("serialize");
        let name = type_name_of::<String>();

        let inserted =
            insert_typed_bytes(&space, "/bridge/x", name, &bytes).expect("insert");
        assert_eq!(inserted.values_inserted, 1);

        let taken =
            take_typed_bytes(&space, "/bridge/x", name, &OutOptions::take()).expect("take");
        assert_eq!(taken, bytes);
    }

    #[test]
    fn test_bridge_unknown_type() {
        let space = PathSpace::new();
        let result = insert_typed_bytes(&space, "/x", "no::such::Type", &[1, 2, 3]);
        assert!(matches!(result, Err(Error::InvalidType(_))));
        let result = take_typed_bytes(&space, "/x", "", &OutOptions::take());
        assert!(matches!(result, Err(Error::InvalidType(_))));
    }

    #[test]
    fn test_bridge_corrupt_bytes() {
        let space = PathSpace::new();
        let name = type_name_of::<String>();
        let result = insert_typed_bytes(&space, "/x", name, &[0xFF, 0xFE]);
        assert!(matches!(result, Err(Error::InvalidType(_))));
    }

    #[test]
    fn test_bridge_zero_payload_inserts_default() {
        let space = PathSpace::new();
        let name = type_name_of::<u64>();
        insert_typed_bytes(&space, "/zero", name, &[]).expect("insert");
        let value: u64 = space.read("/zero").expect("read");
        assert_eq!(value, 0);
    }

    #[test]
    fn test_bridge_take_empty_propagates() {
        let space = PathSpace::new();
        space.insert("/present", &1u32);
        let name = type_name_of::<u32>();
        let _ = take_typed_bytes(&space, "/present", name, &OutOptions::take()).expect("take");
        let result = take_typed_bytes(&space, "/present", name, &OutOptions::take());
        assert!(matches!(result, Err(Error::NoObjectFound(_))));
        let result = take_typed_bytes(&space, "/absent", name, &OutOptions::take());
        assert!(matches!(result, Err(Error::NoSuchPath(_))));
    }
}
