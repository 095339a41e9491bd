use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use dmf_common::error::{MfError, RemoteCallError, Result};
use parking_lot::{Mutex, RwLock};

/// What happens to a value when it is erased or overwritten (spec §4.2).
/// In safe Rust there is no manual `delete[]` to choose between; the
/// variants are kept because callers use them to express *who is allowed
/// to erase this entry* rather than how its memory is reclaimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionPolicy {
    NoDelete,
    DeleteValue,
    DeleteArray,
}

struct Entry {
    value: Arc<Mutex<Box<dyn Any + Send + Sync>>>,
    type_id: TypeId,
    type_name: &'static str,
    policy: DeletionPolicy,
}

/// A per-node keyed variable store holding matrix blocks and auxiliary
/// vectors (spec §4.2). A reader/writer lock guards the name -> entry map
/// itself; each entry additionally carries its own mutex so one task's
/// in-place mutation of a block does not block unrelated lookups.
#[derive(Default)]
pub struct Environment {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        value: T,
        policy: DeletionPolicy,
    ) -> Result<()> {
        let name = name.into();
        let mut map = self.entries.write();
        if map.contains_key(&name) {
            return Err(MfError::RemoteCall(RemoteCallError::NameExists(name)));
        }
        map.insert(
            name,
            Entry {
                value: Arc::new(Mutex::new(Box::new(value))),
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                policy,
            },
        );
        Ok(())
    }

    fn typed_entry<T: 'static>(&self, name: &str) -> Result<Arc<Mutex<Box<dyn Any + Send + Sync>>>> {
        let map = self.entries.read();
        let entry = map
            .get(name)
            .ok_or_else(|| MfError::RemoteCall(RemoteCallError::UnknownName(name.to_string())))?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(MfError::RemoteCall(RemoteCallError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
                found: entry.type_name,
            }));
        }
        Ok(entry.value.clone())
    }

    /// `get<T>`: returns a clone of the stored value.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Result<T> {
        let slot = self.typed_entry::<T>(name)?;
        let guard = slot.lock();
        Ok(guard.downcast_ref::<T>().unwrap().clone())
    }

    /// `setCopy`: overwrite an existing entry with a new value of the same
    /// type, leaving the deletion policy untouched.
    pub fn set_copy<T: Send + Sync + 'static>(&self, name: &str, value: T) -> Result<()> {
        let slot = self.typed_entry::<T>(name)?;
        *slot.lock() = Box::new(value);
        Ok(())
    }

    /// Mutate a stored value in place without cloning it out, e.g. an SGD
    /// task writing into its held H-block.
    pub fn with_mut<T: Send + Sync + 'static, R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let slot = self.typed_entry::<T>(name)?;
        let mut guard = slot.lock();
        Ok(f(guard.downcast_mut::<T>().unwrap()))
    }

    pub fn erase<T: 'static>(&self, name: &str) -> Result<()> {
        let mut map = self.entries.write();
        match map.get(name) {
            Some(entry) if entry.type_id == TypeId::of::<T>() => {
                map.remove(name);
                Ok(())
            }
            Some(entry) => Err(MfError::RemoteCall(RemoteCallError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
                found: entry.type_name,
            })),
            None => Err(MfError::RemoteCall(RemoteCallError::UnknownName(
                name.to_string(),
            ))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn type_name(&self, name: &str) -> Result<&'static str> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.type_name)
            .ok_or_else(|| MfError::RemoteCall(RemoteCallError::UnknownName(name.to_string())))
    }

    pub fn policy(&self, name: &str) -> Result<DeletionPolicy> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.policy)
            .ok_or_else(|| MfError::RemoteCall(RemoteCallError::UnknownName(name.to_string())))
    }
}

/// Fan an operation out across every node's environment (spec §4.2:
/// "createCopyAll / setCopyAll / eraseAll ... best-effort broadcast that
/// the caller must sequence" — there is deliberately no replication
/// coordinator here).
pub fn create_copy_all<T: Clone + Send + Sync + 'static>(
    envs: &[Arc<Environment>],
    name: &str,
    value: T,
    policy: DeletionPolicy,
) -> Result<()> {
    for env in envs {
        env.create(name, value.clone(), policy)?;
    }
    Ok(())
}

pub fn set_copy_all<T: Clone + Send + Sync + 'static>(
    envs: &[Arc<Environment>],
    name: &str,
    value: T,
) -> Result<()> {
    for env in envs {
        env.set_copy(name, value.clone())?;
    }
    Ok(())
}

pub fn erase_all<T: 'static>(envs: &[Arc<Environment>], name: &str) -> Result<()> {
    for env in envs {
        env.erase::<T>(name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let env = Environment::new();
        env.create("w", vec![1.0, 2.0, 3.0], DeletionPolicy::DeleteValue)
            .unwrap();
        let v: Vec<f64> = env.get("w").unwrap();
        assert_eq!(v, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn erase_then_get_is_unknown_name() {
        let env = Environment::new();
        env.create("w", 1i32, DeletionPolicy::NoDelete).unwrap();
        env.erase::<i32>("w").unwrap();
        let err = env.get::<i32>("w");
        assert!(matches!(
            err,
            Err(MfError::RemoteCall(RemoteCallError::UnknownName(_)))
        ));
    }

    #[test]
    fn create_collision_is_name_exists() {
        let env = Environment::new();
        env.create("w", 1i32, DeletionPolicy::NoDelete).unwrap();
        let err = env.create("w", 2i32, DeletionPolicy::NoDelete);
        assert!(matches!(
            err,
            Err(MfError::RemoteCall(RemoteCallError::NameExists(_)))
        ));
    }

    #[test]
    fn wrong_type_is_type_mismatch() {
        let env = Environment::new();
        env.create("w", 1i32, DeletionPolicy::NoDelete).unwrap();
        let err = env.get::<f64>("w");
        assert!(matches!(
            err,
            Err(MfError::RemoteCall(RemoteCallError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn with_mut_mutates_in_place() {
        let env = Environment::new();
        env.create("h", vec![1.0, 2.0], DeletionPolicy::DeleteValue)
            .unwrap();
        env.with_mut::<Vec<f64>, _>("h", |v| v[0] += 10.0).unwrap();
        let v: Vec<f64> = env.get("h").unwrap();
        assert_eq!(v[0], 11.0);
    }
}
