use crate::core::error::Result;
use crate::store::layout::ALL_DIRS;
use crate::store::object_store::{ObjectStore, StoreEntry};

/// Cross-dataset eviction bounding total store usage.
///
/// Walks directories in ascending priority (caches before user-durable
/// tag state) and within each directory oldest-modified first, deleting
/// entries the `preserve` predicate does not protect until usage is at
/// or below `max_bytes`. Soft budget: preserved entries are never
/// removed even if the budget is still exceeded afterward.
pub fn enforce_budget(
    store: &ObjectStore,
    max_bytes: u64,
    preserve: &dyn Fn(&StoreEntry) -> bool,
) -> Result<Vec<(String, String)>> {
    let mut removed = Vec::new();
    if !store.is_available() {
        return Ok(removed);
    }

    let mut usage = store.usage();
    if usage <= max_bytes {
        return Ok(removed);
    }

    for dir in ALL_DIRS {
        let mut entries = store.list(dir)?;
        entries.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));

        for entry in entries {
            if usage <= max_bytes {
                return Ok(removed);
            }
            if preserve(&entry) {
                continue;
            }
            store.delete(&entry.directory, &entry.name)?;
            usage = usage.saturating_sub(entry.size);
            removed.push((entry.directory, entry.name));
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::layout::{BATCHES_DIR, INDEX_DIR, TAGS_DIR};
    use std::thread::sleep;
    use std::time::Duration;

    fn filled_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        // Distinct mtimes so the oldest-first order is deterministic.
        store.write_atomic(BATCHES_DIR, "old.bin", &[0u8; 100]).unwrap();
        sleep(Duration::from_millis(20));
        store.write_atomic(BATCHES_DIR, "new.bin", &[0u8; 100]).unwrap();
        sleep(Duration::from_millis(20));
        store.write_atomic(INDEX_DIR, "idx.json", &[0u8; 100]).unwrap();
        store.write_atomic(TAGS_DIR, "tags.json", &[0u8; 100]).unwrap();
        (dir, store)
    }

    #[test]
    fn evicts_oldest_caches_first() {
        let (_dir, store) = filled_store();
        let removed = enforce_budget(&store, 300, &|_| false).unwrap();
        assert_eq!(removed, vec![(BATCHES_DIR.to_string(), "old.bin".to_string())]);
        assert!(store.usage() <= 300);
    }

    #[test]
    fn stops_once_under_budget() {
        let (_dir, store) = filled_store();
        let removed = enforce_budget(&store, 200, &|_| false).unwrap();
        assert_eq!(removed.len(), 2);
        // Tag state survives while cache eviction suffices.
        assert!(store.exists(TAGS_DIR, "tags.json"));
    }

    #[test]
    fn preserved_entries_survive_even_over_budget() {
        let (_dir, store) = filled_store();
        let removed = enforce_budget(&store, 0, &|e| e.directory == BATCHES_DIR).unwrap();
        assert!(store.exists(BATCHES_DIR, "old.bin"));
        assert!(store.exists(BATCHES_DIR, "new.bin"));
        // Everything unprotected is gone, budget still exceeded.
        assert_eq!(removed.len(), 2);
        assert!(store.usage() > 0);
    }

    #[test]
    fn no_eviction_when_within_budget() {
        let (_dir, store) = filled_store();
        let removed = enforce_budget(&store, 10_000, &|_| false).unwrap();
        assert!(removed.is_empty());
    }
}
