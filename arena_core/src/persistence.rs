//! Sled-backed instance storage.
//!
//! Snapshots are stored as JSON under the instance's storage name, so two
//! seeds of one slot never share an entry.

use arena_env::{EnvError, EnvironmentKey, InstanceSnapshot, PersistenceProvider};
use std::path::{Path, PathBuf};

const PROBE_KEY: &[u8] = b"__probe__";

/// Persistent snapshot store on an embedded key-value database.
pub struct SledPersistence {
    db: sled::Db,
    root: PathBuf,
}

impl SledPersistence {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EnvError> {
        let db = sled::open(path.as_ref())
            .map_err(|e| EnvError::persistence(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self {
            db,
            root: path.as_ref().to_path_buf(),
        })
    }

    /// Create a temporary store, deleted on drop
    pub fn open_temp() -> Result<Self, EnvError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EnvError::persistence(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self {
            db,
            root: PathBuf::from("temporary"),
        })
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl PersistenceProvider for SledPersistence {
    fn probe(&self) -> Result<(), EnvError> {
        self.db
            .insert(PROBE_KEY, &[1u8])
            .map_err(|e| EnvError::persistence(format!("Probe write failed: {}", e)))?;
        self.db
            .remove(PROBE_KEY)
            .map_err(|e| EnvError::persistence(format!("Probe remove failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| EnvError::persistence(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn path_for(&self, key: EnvironmentKey) -> PathBuf {
        self.root.join(key.storage_name())
    }

    fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), EnvError> {
        let value = serde_json::to_vec(snapshot)
            .map_err(|e| EnvError::persistence(format!("Encode failed: {}", e)))?;
        self.db
            .insert(snapshot.key.storage_name().as_bytes(), value)
            .map_err(|e| EnvError::persistence(format!("Insert failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| EnvError::persistence(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn load(&self, key: EnvironmentKey) -> Result<Option<InstanceSnapshot>, EnvError> {
        let Some(bytes) = self
            .db
            .get(key.storage_name().as_bytes())
            .map_err(|e| EnvError::persistence(format!("Read failed: {}", e)))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EnvError::persistence(format!("Decode of {} failed: {}", key, e)))
    }

    fn delete(&self, key: EnvironmentKey) -> Result<(), EnvError> {
        self.db
            .remove(key.storage_name().as_bytes())
            .map_err(|e| EnvError::persistence(format!("Remove failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_env::{BlockPos, Slot, Variant};

    fn snapshot(seed: u64, tick: u64) -> InstanceSnapshot {
        InstanceSnapshot {
            key: EnvironmentKey::new(Slot(3), Variant::Primary, seed),
            spawn: BlockPos::new(1, 65, -4),
            tick,
            tick_speed: 1,
            saved_at_ms: 1000,
        }
    }

    #[test]
    fn test_save_load_delete() {
        let store = SledPersistence::open_temp().unwrap();
        store.probe().unwrap();
        assert!(store.is_empty());

        let snap = snapshot(42, 6000);
        store.save(&snap).unwrap();
        assert_eq!(store.load(snap.key).unwrap(), Some(snap.clone()));

        store.delete(snap.key).unwrap();
        assert_eq!(store.load(snap.key).unwrap(), None);
    }

    #[test]
    fn test_seeds_are_stored_separately() {
        let store = SledPersistence::open_temp().unwrap();
        store.save(&snapshot(1, 10)).unwrap();
        store.save(&snapshot(2, 20)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.load(snapshot(1, 0).key).unwrap().unwrap().tick, 10);
        assert_eq!(store.load(snapshot(2, 0).key).unwrap().unwrap().tick, 20);
    }

    #[test]
    fn test_path_uses_storage_name() {
        let store = SledPersistence::open_temp().unwrap();
        let key = EnvironmentKey::new(Slot(3), Variant::Primary, 42);
        assert_eq!(store.path_for(key), PathBuf::from("temporary/slot_3/primary/seed_42"));
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let store = SledPersistence::open_temp().unwrap();
        let key = EnvironmentKey::new(Slot(1), Variant::Secondary, 9);
        store.db.insert(key.storage_name().as_bytes(), b"not json".to_vec()).unwrap();
        assert!(store.load(key).is_err());
    }
}
