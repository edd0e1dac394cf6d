//! The File Manifest Store: `path -> ordered [(digest, logical_length)]`
//! (spec §4.5).
//!
//! Same persistence discipline as [`crate::chunk_index::ChunkIndex`]: an
//! in-memory map, background-dumped to `file_chunks.json` through the same
//! [`Persister`]/[`persist::replace_file`] machinery.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::persist::{self, Persister};

/// One chunk reference within a manifest: its digest and logical length.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    pub length: u32,
}

pub type Manifest = Vec<ManifestEntry>;

pub struct ManifestStore {
    inner: Arc<RwLock<HashMap<String, Manifest>>>,
    _persister: Persister,
}

impl ManifestStore {
    pub fn load_or_create(path: PathBuf) -> Result<Self> {
        let map: HashMap<String, Manifest> = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("parsing manifest store at {}", path.display()))?
        } else {
            HashMap::new()
        };

        let inner = Arc::new(RwLock::new(map));
        let dump_inner = inner.clone();
        let dump_path = path.clone();
        let persister = Persister::spawn("manifest-store", move || {
            let snapshot = dump_inner
                .read()
                .expect("manifest store lock poisoned")
                .clone();
            let data = serde_json::to_vec_pretty(&snapshot)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            persist::replace_file(&dump_path, &data)
        });

        Ok(ManifestStore {
            inner,
            _persister: persister,
        })
    }

    pub fn get(&self, path: &str) -> Option<Manifest> {
        self.inner
            .read()
            .expect("manifest store lock poisoned")
            .get(path)
            .cloned()
    }

    /// Replaces the manifest for `path` wholesale.
    pub fn put(&self, path: String, manifest: Manifest) {
        self.inner
            .write()
            .expect("manifest store lock poisoned")
            .insert(path, manifest);
        self._persister.request_dump();
    }

    /// Removes `path`'s manifest entirely. Chunks it referenced are not
    /// touched here; GC reclaims them once no manifest refers to them.
    pub fn delete(&self, path: &str) {
        let removed = self
            .inner
            .write()
            .expect("manifest store lock poisoned")
            .remove(path)
            .is_some();
        if removed {
            self._persister.request_dump();
        }
    }

    /// Snapshot of every path's manifest, used at mount time and by GC's
    /// mark phase.
    pub fn all(&self) -> HashMap<String, Manifest> {
        self.inner.read().expect("manifest store lock poisoned").clone()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.read().expect("manifest store lock poisoned").contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(digest: &str, length: u32) -> ManifestEntry {
        ManifestEntry {
            digest: digest.to_string(),
            length,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::load_or_create(dir.path().join("file_chunks.json")).unwrap();

        let manifest = vec![entry("d1", 4096), entry("d2", 2048)];
        store.put("/foo/bar".to_string(), manifest.clone());

        assert_eq!(store.get("/foo/bar"), Some(manifest));
        assert_eq!(store.get("/missing"), None);
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::load_or_create(dir.path().join("file_chunks.json")).unwrap();

        store.put("/foo".to_string(), vec![entry("d1", 10)]);
        store.delete("/foo");

        assert_eq!(store.get("/foo"), None);
        assert!(!store.contains("/foo"));
    }

    #[test]
    fn all_reflects_every_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::load_or_create(dir.path().join("file_chunks.json")).unwrap();

        store.put("/a".to_string(), vec![entry("d1", 1)]);
        store.put("/b".to_string(), vec![entry("d2", 2)]);

        let all = store.all();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("/a"));
        assert!(all.contains_key("/b"));
    }
}
