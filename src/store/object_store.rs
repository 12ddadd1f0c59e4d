use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::core::error::{Error, ErrorKind, Result};
use crate::store::layout::{ALL_DIRS, StoreLayout};

/// A view over one persisted file, as reported by `list`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub directory: String,
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Thin wrapper over the origin-scoped durable file tree. All writes go
/// through atomic replace so readers never observe partial content.
pub struct ObjectStore {
    layout: StoreLayout,
    available: bool,
}

impl ObjectStore {
    /// Open the store rooted at `root`, probing availability by creating
    /// the directory tree and round-tripping a probe file. A failed
    /// probe yields an unavailable store rather than an error; callers
    /// degrade to memory-only operation.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let layout = StoreLayout::new(root);
        let available = Self::probe(&layout);
        ObjectStore { layout, available }
    }

    /// A store that never persists anything. Every operation returns
    /// `ErrorKind::Unavailable`.
    pub fn unavailable() -> Self {
        ObjectStore {
            layout: StoreLayout::new(PathBuf::new()),
            available: false,
        }
    }

    fn probe(layout: &StoreLayout) -> bool {
        for dir in ALL_DIRS {
            if fs::create_dir_all(layout.dir_path(dir)).is_err() {
                return false;
            }
        }
        let probe = layout.probe_path();
        if fs::write(&probe, b"ok").is_err() {
            return false;
        }
        fs::remove_file(&probe).is_ok()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn root(&self) -> &StoreLayout {
        &self.layout
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Unavailable, "durable store unavailable"))
        }
    }

    /// Write `data` to `directory/name` through a fresh temp file and an
    /// atomic rename, so a concurrent reader sees either the old content
    /// or the new, never a prefix.
    pub fn write_atomic(&self, directory: &str, name: &str, data: &[u8]) -> Result<()> {
        self.check_available()?;
        let dir = self.layout.dir_path(directory);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(self.layout.file_path(directory, name))
            .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?;
        Ok(())
    }

    pub fn read(&self, directory: &str, name: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        let path = self.layout.file_path(directory, name);
        if !path.exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("{}/{}", directory, name),
            ));
        }
        Ok(fs::read(path)?)
    }

    pub fn exists(&self, directory: &str, name: &str) -> bool {
        self.available && self.layout.file_path(directory, name).exists()
    }

    /// Idempotent delete: removing a missing file succeeds.
    pub fn delete(&self, directory: &str, name: &str) -> Result<()> {
        self.check_available()?;
        let path = self.layout.file_path(directory, name);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self, directory: &str) -> Result<Vec<StoreEntry>> {
        self.check_available()?;
        let dir = self.layout.dir_path(directory);
        let mut entries = Vec::new();
        if !dir.exists() {
            return Ok(entries);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let last_modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(StoreEntry {
                directory: directory.to_string(),
                name,
                size: meta.len(),
                last_modified,
            });
        }
        Ok(entries)
    }

    /// Total bytes across every known directory.
    pub fn usage(&self) -> u64 {
        if !self.available {
            return 0;
        }
        ALL_DIRS
            .iter()
            .filter_map(|d| self.list(d).ok())
            .flatten()
            .map(|e| e.size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::layout::BATCHES_DIR;

    #[test]
    fn write_read_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        assert!(store.is_available());

        store.write_atomic(BATCHES_DIR, "a.bin", b"hello").unwrap();
        assert_eq!(store.read(BATCHES_DIR, "a.bin").unwrap(), b"hello");

        store.delete(BATCHES_DIR, "a.bin").unwrap();
        assert_eq!(
            store.read(BATCHES_DIR, "a.bin").unwrap_err().kind,
            ErrorKind::NotFound
        );
        // Deleting again is fine.
        store.delete(BATCHES_DIR, "a.bin").unwrap();
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        store.write_atomic(BATCHES_DIR, "a.bin", b"first").unwrap();
        store.write_atomic(BATCHES_DIR, "a.bin", b"second").unwrap();
        assert_eq!(store.read(BATCHES_DIR, "a.bin").unwrap(), b"second");
        assert_eq!(store.list(BATCHES_DIR).unwrap().len(), 1);
    }

    #[test]
    fn unavailable_store_refuses_operations() {
        let store = ObjectStore::unavailable();
        let err = store.write_atomic(BATCHES_DIR, "a.bin", b"x").unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(store.usage(), 0);
    }
}
