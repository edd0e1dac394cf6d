//! The Chunk Index: `digest -> (container, offset, length)` (spec §4.4).
//!
//! Persisted the way `tape/inventory.rs` persists its `MediaId` map: one
//! JSON blob, rewritten wholesale through [`persist::replace_file`] rather
//! than an embedded database. A background [`Persister`] thread owns the
//! actual disk write so that `insert`/`replace_all` never block their
//! caller on I/O.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::persist::{self, Persister};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ChunkLocation {
    pub container: String,
    pub offset: u64,
    pub length: u32,
}

/// In-memory chunk index with a background-dumped on-disk mirror.
pub struct ChunkIndex {
    inner: Arc<RwLock<HashMap<String, ChunkLocation>>>,
    // Held only to keep the background thread alive for as long as the
    // index is; dropping the index joins the thread after its last dump.
    _persister: Persister,
}

impl ChunkIndex {
    /// Loads `chunk_metadata.json` from `path` if it exists, or starts
    /// empty. An unparseable file is returned as an error; whether that is
    /// fatal for the caller (per spec §4.4: only tolerable if no manifest
    /// references anything) is a decision for the datastore, not this type.
    pub fn load_or_create(path: PathBuf) -> Result<Self> {
        let map: HashMap<String, ChunkLocation> = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("parsing chunk index at {}", path.display()))?
        } else {
            HashMap::new()
        };

        let inner = Arc::new(RwLock::new(map));
        let dump_inner = inner.clone();
        let dump_path = path.clone();
        let persister = Persister::spawn("chunk-index", move || {
            let snapshot = dump_inner
                .read()
                .expect("chunk index lock poisoned")
                .clone();
            let data = serde_json::to_vec_pretty(&snapshot)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            persist::replace_file(&dump_path, &data)
        });

        Ok(ChunkIndex {
            inner,
            _persister: persister,
        })
    }

    pub fn exists(&self, digest: &str) -> bool {
        self.inner.read().expect("chunk index lock poisoned").contains_key(digest)
    }

    pub fn lookup(&self, digest: &str) -> Option<ChunkLocation> {
        self.inner
            .read()
            .expect("chunk index lock poisoned")
            .get(digest)
            .cloned()
    }

    /// Idempotent insert: first writer wins, a re-insert of an existing
    /// digest is a no-op.
    pub fn insert(&self, digest: String, location: ChunkLocation) {
        let inserted = {
            let mut map = self.inner.write().expect("chunk index lock poisoned");
            if map.contains_key(&digest) {
                false
            } else {
                map.insert(digest, location);
                true
            }
        };
        if inserted {
            self._persister.request_dump();
        }
    }

    /// Bulk atomic swap, used by GC after compaction.
    pub fn replace_all(&self, new_map: HashMap<String, ChunkLocation>) {
        *self.inner.write().expect("chunk index lock poisoned") = new_map;
        self._persister.request_dump();
    }

    pub fn snapshot(&self) -> HashMap<String, ChunkLocation> {
        self.inner.read().expect("chunk index lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("chunk index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(container: &str, offset: u64, length: u32) -> ChunkLocation {
        ChunkLocation {
            container: container.to_string(),
            offset,
            length,
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = ChunkIndex::load_or_create(dir.path().join("chunk_metadata.json")).unwrap();

        index.insert("abc".into(), loc("a.container", 0, 100));
        index.insert("abc".into(), loc("b.container", 500, 999));

        assert_eq!(index.lookup("abc"), Some(loc("a.container", 0, 100)));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk_metadata.json");

        {
            let index = ChunkIndex::load_or_create(path.clone()).unwrap();
            index.insert("digest1".into(), loc("f.container", 0, 4096));
            index.insert("digest2".into(), loc("f.container", 4096, 2048));
            index.request_dump_for_test();
        }

        // Give the background thread a moment to land the write.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let reloaded = ChunkIndex::load_or_create(path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup("digest1"), Some(loc("f.container", 0, 4096)));
    }
}

#[cfg(test)]
impl ChunkIndex {
    fn request_dump_for_test(&self) {
        self._persister.request_dump();
    }
}
