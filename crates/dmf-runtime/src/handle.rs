use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dmf_common::error::{MfError, RemoteCallError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::task_manager::Rank;

/// A remote handle: rank + name (spec §4.2). Cheap to copy, can be
/// mutated/erased/read by any task that resolves it against the owning
/// node's `Environment`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteVar {
    pub rank: Rank,
    pub name: String,
}

impl RemoteVar {
    pub fn new(rank: Rank, name: impl Into<String>) -> Self {
        Self {
            rank,
            name: name.into(),
        }
    }

    pub fn is_local(&self, here: Rank) -> bool {
        self.rank == here
    }
}

/// Per-process table backing "pointer exchange" (spec §9 design note):
/// the source marshals raw same-process pointers between cooperating
/// local tasks (`pointerToInt`/`intToPointer`); here a `u64` key is the
/// only thing that crosses a channel, and the table maps it back to the
/// `Arc` it names. Swapping ownership of a block between two same-node
/// tasks (DSGD+'s H-block handoff, §4.6) is then just handing the key
/// across, never a raw address.
#[derive(Default)]
pub struct HandleTable {
    next: AtomicU64,
    slots: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleKey(pub u64);

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, value: Arc<T>) -> HandleKey {
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(key, value);
        HandleKey(key)
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: HandleKey) -> Result<Arc<T>> {
        let slots = self.slots.lock();
        let any = slots
            .get(&key.0)
            .ok_or_else(|| {
                MfError::RemoteCall(RemoteCallError::UnknownName(format!(
                    "handle#{}",
                    key.0
                )))
            })?
            .clone();
        any.downcast::<T>().map_err(|_| {
            MfError::RemoteCall(RemoteCallError::TypeMismatch {
                name: format!("handle#{}", key.0),
                expected: std::any::type_name::<T>(),
                found: "unknown",
            })
        })
    }

    /// Re-key an existing slot, the table-based equivalent of swapping two
    /// pointers: both sides now see the same underlying value under a key
    /// they each recognise as "mine".
    pub fn remove(&self, key: HandleKey) -> Option<Arc<dyn Any + Send + Sync>> {
        self.slots.lock().remove(&key.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let table = HandleTable::new();
        let key = table.insert(Arc::new(vec![1.0, 2.0, 3.0]));
        let v: Arc<Vec<f64>> = table.get(key).unwrap();
        assert_eq!(*v, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn unknown_key_is_unknown_name() {
        let table = HandleTable::new();
        let err = table.get::<Vec<f64>>(HandleKey(999));
        assert!(matches!(
            err,
            Err(MfError::RemoteCall(RemoteCallError::UnknownName(_)))
        ));
    }
}
