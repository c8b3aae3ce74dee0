use crate::consensus::Index;
use crate::storage::{StorageEngine, StorageError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

// Theoretical model of a durable partition, same spirit as modeling a commit log in
// memory: the replication semantics are what's under test, not disk plumbing. The single
// RwLock is what makes snapshot restore atomic with respect to concurrent readers.
pub struct InMemoryStorage {
    state: RwLock<State>,
    // Test hook: flip on to make every write fail, simulating a dying disk.
    fail_writes: AtomicBool,
}

struct State {
    map: HashMap<Bytes, Bytes>,
    applied_watermark: Option<Index>,
}

/// A frozen copy of the whole partition. Cheap to clone and hand around.
#[derive(Clone)]
pub struct InMemorySnapshot {
    map: Arc<HashMap<Bytes, Bytes>>,
    applied_watermark: Option<Index>,
}

impl InMemoryStorage {
    pub fn create() -> Self {
        InMemoryStorage {
            state: RwLock::new(State {
                map: HashMap::new(),
                applied_watermark: None,
            }),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().map.len()
    }

    fn check_write_fault(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Acquire) {
            Err(StorageError::Io("injected write fault".to_string()))
        } else {
            Ok(())
        }
    }
}

impl StorageEngine for InMemoryStorage {
    type Snapshot = InMemorySnapshot;

    fn put(&self, key: Bytes, value: Bytes) -> Result<(), StorageError> {
        self.check_write_fault()?;
        self.state.write().unwrap().map.insert(key, value);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        Ok(self.state.read().unwrap().map.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.check_write_fault()?;
        self.state.write().unwrap().map.remove(key);
        Ok(())
    }

    fn consistent_snapshot_read(&self) -> Result<Self::Snapshot, StorageError> {
        let state = self.state.read().unwrap();
        Ok(InMemorySnapshot {
            map: Arc::new(state.map.clone()),
            applied_watermark: state.applied_watermark,
        })
    }

    fn restore_from_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError> {
        self.check_write_fault()?;
        let mut state = self.state.write().unwrap();
        state.map = snapshot.map.as_ref().clone();
        state.applied_watermark = snapshot.applied_watermark;
        Ok(())
    }

    fn record_applied(&self, index: Index) -> Result<(), StorageError> {
        self.check_write_fault()?;
        self.state.write().unwrap().applied_watermark = Some(index);
        Ok(())
    }

    fn applied_watermark(&self) -> Result<Option<Index>, StorageError> {
        Ok(self.state.read().unwrap().applied_watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn snapshot_capture_is_a_frozen_copy() {
        let storage = InMemoryStorage::create();
        storage.put(b("k1"), b("v1")).unwrap();
        storage.record_applied(Index::new(1)).unwrap();

        let snapshot = storage.consistent_snapshot_read().unwrap();

        // Mutations after the capture don't leak into it.
        storage.put(b("k1"), b("v2")).unwrap();
        storage.put(b("k2"), b("v2")).unwrap();
        storage.record_applied(Index::new(3)).unwrap();

        storage.restore_from_snapshot(snapshot).unwrap();
        assert_eq!(storage.get(b"k1").unwrap(), Some(b("v1")));
        assert_eq!(storage.get(b"k2").unwrap(), None);
        assert_eq!(storage.applied_watermark().unwrap(), Some(Index::new(1)));
    }

    #[test]
    fn injected_write_fault_fails_all_writes() {
        let storage = InMemoryStorage::create();
        storage.put(b("k1"), b("v1")).unwrap();

        storage.fail_writes(true);
        assert!(storage.put(b("k2"), b("v2")).is_err());
        assert!(storage.delete(b"k1").is_err());
        assert!(storage.record_applied(Index::new(1)).is_err());

        // Reads still work; the replica-level halt decision belongs to the engine.
        assert_eq!(storage.get(b"k1").unwrap(), Some(b("v1")));
    }
}
