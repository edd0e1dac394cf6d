//! Container Writer (spec §4.3): append-only chunk container files under
//! `.dedup_store/`, one exclusive lock per container.
//!
//! Grounded in `pbs-datastore::chunk_store::ChunkStore`'s own split between
//! "the directory of backing files" and "a lock per thing writers
//! contend on" - here a lock per container file rather than PBS's single
//! `ProcessLocker`, since containers (unlike PBS's shared chunk directory)
//! are not written by more than one logical file's writers at a time in
//! the common case, but GC still needs exclusive access while compacting.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};

use crate::persist;

pub const CONTAINER_SUFFIX: &str = ".container";

/// Turns a logical file path into its container file name: strip the
/// leading `/`, replace the rest with `_`, append `.container`.
pub fn sanitize_container_name(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let mut name = String::with_capacity(trimmed.len() + CONTAINER_SUFFIX.len());
    for c in trimmed.chars() {
        name.push(if c == '/' { '_' } else { c });
    }
    name.push_str(CONTAINER_SUFFIX);
    name
}

/// Directory of append-only container files backing the chunk store.
pub struct ContainerStore {
    dir: PathBuf,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl ContainerStore {
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating container directory {}", dir.display()))?;
        Ok(ContainerStore {
            dir,
            locks: RwLock::new(HashMap::new()),
        })
    }

    fn lock_for(&self, container_name: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().expect("container lock table poisoned").get(container_name) {
            return lock.clone();
        }
        self.locks
            .write()
            .expect("container lock table poisoned")
            .entry(container_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, container_name: &str) -> PathBuf {
        self.dir.join(container_name)
    }

    /// Runs `f` while holding the exclusive lock for `container_name`.
    /// GC uses this to hold the lock across a whole read-compact-rename
    /// sequence; `append`/`read`/`size` use it for a single operation.
    pub fn with_container_lock<T>(
        &self,
        container_name: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let lock = self.lock_for(container_name);
        let _guard = lock.lock().expect("container lock poisoned");
        f()
    }

    /// Appends `bytes` at the container's current end and returns the
    /// offset they were written at.
    pub fn append(&self, container_name: &str, bytes: &[u8]) -> Result<u64> {
        self.with_container_lock(container_name, || self.append_unlocked(container_name, bytes))
    }

    pub fn append_unlocked(&self, container_name: &str, bytes: &[u8]) -> Result<u64> {
        let path = self.path_for(container_name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening container {}", path.display()))?;
        let offset = file.metadata()?.len();
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(offset)
    }

    pub fn size(&self, container_name: &str) -> Result<u64> {
        self.with_container_lock(container_name, || self.size_unlocked(container_name))
    }

    pub fn size_unlocked(&self, container_name: &str) -> Result<u64> {
        match fs::metadata(self.path_for(container_name)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads `length` bytes starting at `offset`. Readers re-open the file
    /// on every call (rather than caching a handle) so a concurrent GC
    /// rewrite is observed cleanly on the next read.
    pub fn read(&self, container_name: &str, offset: u64, length: u32) -> Result<Vec<u8>> {
        self.read_unlocked(container_name, offset, length)
    }

    pub fn read_unlocked(&self, container_name: &str, offset: u64, length: u32) -> Result<Vec<u8>> {
        let path = self.path_for(container_name);
        let mut file =
            File::open(&path).with_context(|| format!("opening container {}", path.display()))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .with_context(|| format!("short read from container {}", path.display()))?;
        Ok(buf)
    }

    /// Atomically replaces the whole container with `data`, used by GC
    /// after compacting out dead chunk ranges. Caller must already hold
    /// the container's lock (via [`with_container_lock`]).
    pub fn replace_unlocked(&self, container_name: &str, data: &[u8]) -> Result<()> {
        persist::replace_file(&self.path_for(container_name), data)
            .with_context(|| format!("replacing container {container_name}"))
    }

    /// Deletes a container file that GC determined has no live chunks.
    /// Caller must already hold the container's lock.
    pub fn delete_unlocked(&self, container_name: &str) -> Result<()> {
        match fs::remove_file(self.path_for(container_name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists every container file currently on disk, by name.
    pub fn list_containers(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(CONTAINER_SUFFIX) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_nested_paths() {
        assert_eq!(sanitize_container_name("/foo/bar/baz.txt"), "foo_bar_baz.txt.container");
        assert_eq!(sanitize_container_name("solo"), "solo.container");
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContainerStore::open(dir.path().join(".dedup_store")).unwrap();

        let off1 = store.append("f.container", b"hello ").unwrap();
        let off2 = store.append("f.container", b"world").unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, 6);

        assert_eq!(store.read("f.container", 0, 6).unwrap(), b"hello ");
        assert_eq!(store.read("f.container", 6, 5).unwrap(), b"world");
        assert_eq!(store.size("f.container").unwrap(), 11);
    }

    #[test]
    fn missing_container_size_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContainerStore::open(dir.path().join(".dedup_store")).unwrap();
        assert_eq!(store.size("nope.container").unwrap(), 0);
    }

    #[test]
    fn replace_then_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContainerStore::open(dir.path().join(".dedup_store")).unwrap();

        store.append("a.container", b"12345").unwrap();
        store.append("b.container", b"xyz").unwrap();

        store
            .with_container_lock("a.container", || store.replace_unlocked("a.container", b"45"))
            .unwrap();
        assert_eq!(store.read("a.container", 0, 2).unwrap(), b"45");

        let mut names = store.list_containers().unwrap();
        names.sort();
        assert_eq!(names, vec!["a.container".to_string(), "b.container".to_string()]);

        store
            .with_container_lock("b.container", || store.delete_unlocked("b.container"))
            .unwrap();
        assert_eq!(store.list_containers().unwrap(), vec!["a.container".to_string()]);
    }
}
