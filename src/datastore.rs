//! `DedupStore`: the top-level orchestrator wiring the Chunker, Container
//! Writer, Chunk Index and File Manifest Store together (spec §5-§6).
//!
//! Grounded in `pbs-datastore::datastore::DataStore` as "the thing that
//! owns every subsystem and is the one object the façade holds a handle
//! to" - same role, much smaller surface, since this crate has no backup
//! groups/snapshots/namespaces to arbitrate.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::chunk_index::{ChunkIndex, ChunkLocation};
use crate::chunk_store::{sanitize_container_name, ContainerStore};
use crate::chunker::Chunker;
use crate::digest;
use crate::error::DedupError;
use crate::gc::GarbageCollector;
use crate::manifest::{Manifest, ManifestEntry, ManifestStore};

/// Number of worker threads used to digest chunk pieces within one write
/// (spec §5: "a bounded worker pool, 8 workers is a reasonable default").
pub const DIGEST_WORKERS: usize = 8;

pub const DEDUP_STORE_DIR: &str = ".dedup_store";
pub const CHUNK_INDEX_FILE: &str = "chunk_metadata.json";
pub const MANIFEST_STORE_FILE: &str = "file_chunks.json";

pub struct DedupStore {
    root: PathBuf,
    containers: Arc<ContainerStore>,
    chunk_index: Arc<ChunkIndex>,
    manifests: Arc<ManifestStore>,
    chunker: Chunker,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    gc: Arc<GarbageCollector>,
}

impl DedupStore {
    /// Opens (creating if necessary) the dedup state rooted at
    /// `<root>/.dedup_store/`.
    ///
    /// Per spec §4.4: a chunk index that fails to parse is always fatal
    /// (propagated by `ChunkIndex::load_or_create`); here we additionally
    /// enforce the invariant that every manifest's digests resolve in the
    /// loaded index, refusing to open rather than silently serving holes.
    pub fn open(root: PathBuf) -> Result<Self> {
        let store_dir = root.join(DEDUP_STORE_DIR);
        fs::create_dir_all(&store_dir)
            .with_context(|| format!("creating {}", store_dir.display()))?;

        let containers = Arc::new(ContainerStore::open(store_dir.clone())?);
        let chunk_index = Arc::new(ChunkIndex::load_or_create(store_dir.join(CHUNK_INDEX_FILE))?);
        let manifests = Arc::new(ManifestStore::load_or_create(store_dir.join(MANIFEST_STORE_FILE))?);

        for (path, manifest) in manifests.all() {
            for entry in &manifest {
                if !chunk_index.exists(&entry.digest) {
                    anyhow::bail!(
                        "chunk index is missing digest {} referenced by manifest {path}; refusing to mount",
                        entry.digest
                    );
                }
            }
        }

        let gc = Arc::new(GarbageCollector::new(
            chunk_index.clone(),
            manifests.clone(),
            containers.clone(),
        ));

        Ok(DedupStore {
            root,
            containers,
            chunk_index,
            manifests,
            chunker: Chunker::new(),
            path_locks: Mutex::new(HashMap::new()),
            gc,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn gc(&self) -> Arc<GarbageCollector> {
        self.gc.clone()
    }

    fn lock_for_path(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .lock()
            .expect("path lock table poisoned")
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -- §6 external interface, as consumed by the façade -----------------

    pub fn chunk_exists(&self, digest: &str) -> bool {
        self.chunk_index.exists(digest)
    }

    /// Appends `bytes` to `path`'s container; `offset` must equal the
    /// container's size before the append (callers obtain it from
    /// [`Self::get_container_size`]), enforcing that writers only ever
    /// append.
    pub fn write_container(&self, path: &str, bytes: &[u8], offset: u64) -> Result<()> {
        let container = sanitize_container_name(path);
        let actual = self.containers.append(&container, bytes)?;
        if actual != offset {
            anyhow::bail!(
                "container {container} append landed at {actual}, caller expected {offset}"
            );
        }
        Ok(())
    }

    pub fn write_chunk_metadata(&self, entries: HashMap<String, ChunkLocation>) {
        for (digest, location) in entries {
            self.chunk_index.insert(digest, location);
        }
    }

    pub fn get_chunk_metadata(&self, digest: &str) -> Option<ChunkLocation> {
        self.chunk_index.lookup(digest)
    }

    pub fn get_container_size(&self, container_name: &str) -> Result<u64> {
        self.containers.size(container_name)
    }

    pub fn store_file_chunks(&self, path: &str, manifest: Manifest) {
        self.manifests.put(path.to_string(), manifest);
    }

    pub fn get_all_file_chunks(&self) -> HashMap<String, Manifest> {
        self.manifests.all()
    }

    // -- facade-facing convenience operations -----------------------------

    pub fn exists(&self, path: &str) -> bool {
        self.manifests.contains(path)
    }

    pub fn file_size(&self, path: &str) -> Option<u64> {
        self.manifests
            .get(path)
            .map(|manifest| manifest.iter().map(|entry| entry.length as u64).sum())
    }

    /// Creates an empty manifest for `path` if one doesn't already exist.
    pub fn create(&self, path: &str) {
        let lock = self.lock_for_path(path);
        let _guard = lock.lock().expect("path lock poisoned");
        if !self.manifests.contains(path) {
            self.manifests.put(path.to_string(), Vec::new());
        }
    }

    /// Removes `path`'s manifest; its chunks become eligible for the next
    /// GC cycle (spec §4.10: "unlink removes the manifest and lets GC
    /// reclaim the chunks later").
    pub fn unlink(&self, path: &str) {
        let lock = self.lock_for_path(path);
        let _guard = lock.lock().expect("path lock poisoned");
        self.manifests.delete(path);
    }

    /// Read path algorithm (spec §4.7): locate the first relevant chunk,
    /// coalesce maximal contiguous-in-container runs into bulk reads, and
    /// slice out exactly `[offset, offset + size)`.
    pub fn read(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>, DedupError> {
        let manifest = self.manifests.get(path).ok_or(DedupError::NotFound)?;
        if size == 0 || manifest.is_empty() {
            return Ok(Vec::new());
        }

        let end_offset = offset + size as u64;

        let mut logical_cursor = 0u64;
        let mut idx = 0usize;
        while idx < manifest.len() {
            let len = manifest[idx].length as u64;
            if logical_cursor + len > offset {
                break;
            }
            logical_cursor += len;
            idx += 1;
        }

        let mut out = Vec::with_capacity(size);
        let mut cursor = logical_cursor;

        while idx < manifest.len() && cursor < end_offset {
            let first_entry = &manifest[idx];
            let first_loc = self.chunk_index.lookup(&first_entry.digest).ok_or_else(|| {
                DedupError::Corrupt(format!(
                    "chunk index missing entry for live digest {}",
                    first_entry.digest
                ))
            })?;

            let mut run_len = 1usize;
            let mut run_byte_len = first_loc.length as u64;
            let mut expect_offset = first_loc.offset + first_loc.length as u64;
            while idx + run_len < manifest.len() {
                let next_entry = &manifest[idx + run_len];
                let next_loc = match self.chunk_index.lookup(&next_entry.digest) {
                    Some(loc) => loc,
                    None => break,
                };
                if next_loc.container != first_loc.container || next_loc.offset != expect_offset {
                    break;
                }
                expect_offset = next_loc.offset + next_loc.length as u64;
                run_byte_len += next_loc.length as u64;
                run_len += 1;
            }

            let bulk = self
                .containers
                .read(&first_loc.container, first_loc.offset, run_byte_len as u32)
                .map_err(|err| DedupError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())))?;

            let mut pos_in_bulk = 0usize;
            for entry in &manifest[idx..idx + run_len] {
                let chunk_start = cursor;
                let chunk_end = chunk_start + entry.length as u64;
                let want_start = offset.max(chunk_start);
                let want_end = end_offset.min(chunk_end);
                if want_end > want_start {
                    let local_start = pos_in_bulk + (want_start - chunk_start) as usize;
                    let local_end = pos_in_bulk + (want_end - chunk_start) as usize;
                    out.extend_from_slice(&bulk[local_start..local_end]);
                }
                pos_in_bulk += entry.length as usize;
                cursor = chunk_end;
            }

            idx += run_len;
        }

        Ok(out)
    }

    /// Write path algorithm (spec §4.8): chunk `data`, digest each piece
    /// (in parallel), append novel chunks to `path`'s container, publish
    /// the chunk index, then splice the manifest. Returns `data.len()`.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, DedupError> {
        let path_lock = self.lock_for_path(path);
        let _guard = path_lock.lock().expect("path lock poisoned");

        let old_manifest = self.manifests.get(path).unwrap_or_default();

        let mut logical_cursor = 0u64;
        let mut k = 0usize;
        while k < old_manifest.len() {
            let len = old_manifest[k].length as u64;
            if logical_cursor + len > offset {
                break;
            }
            logical_cursor += len;
            k += 1;
        }

        if data.is_empty() {
            return Ok(0);
        }

        let mut pieces: Vec<&[u8]> = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let len = self.chunker.determine_chunk_size(data, pos);
            pieces.push(&data[pos..pos + len]);
            pos += len;
        }

        let digests = digest_pieces(&pieces);

        let container_name = sanitize_container_name(path);
        let mut staged: HashMap<String, ChunkLocation> = HashMap::new();
        let mut new_entries: Manifest = Vec::with_capacity(pieces.len());

        for (piece, piece_digest) in pieces.iter().zip(digests.iter()) {
            if !self.chunk_index.exists(piece_digest) && !staged.contains_key(piece_digest) {
                let write_offset = self
                    .containers
                    .append(&container_name, piece)
                    .map_err(|err| DedupError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())))?;
                staged.insert(
                    piece_digest.clone(),
                    ChunkLocation {
                        container: container_name.clone(),
                        offset: write_offset,
                        length: piece.len() as u32,
                    },
                );
            }
            new_entries.push(ManifestEntry {
                digest: piece_digest.clone(),
                length: piece.len() as u32,
            });
        }

        // Container bytes are already durable (each append syncs); publish
        // the chunk index only now, so a crash never advertises a digest
        // whose bytes aren't on disk yet.
        for (piece_digest, location) in staged {
            self.chunk_index.insert(piece_digest, location);
        }

        let mut manifest = Vec::with_capacity(k + new_entries.len() + old_manifest.len());
        manifest.extend_from_slice(&old_manifest[..k.min(old_manifest.len())]);
        manifest.extend(new_entries);
        if k < old_manifest.len() {
            manifest.extend_from_slice(&old_manifest[k + 1..]);
        }

        self.manifests.put(path.to_string(), manifest);

        Ok(data.len())
    }
}

/// Digests every piece, spreading the work across [`DIGEST_WORKERS`]
/// threads while preserving input order in the returned `Vec`.
fn digest_pieces(pieces: &[&[u8]]) -> Vec<String> {
    if pieces.len() <= 1 {
        return pieces.iter().map(|piece| digest::hash_chunk(piece)).collect();
    }

    let worker_count = DIGEST_WORKERS.min(pieces.len());
    let mut results: Vec<Option<String>> = vec![None; pieces.len()];

    let grouped: Vec<Vec<(usize, String)>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..worker_count)
            .map(|worker| {
                scope.spawn(move || {
                    (worker..pieces.len())
                        .step_by(worker_count)
                        .map(|i| (i, digest::hash_chunk(pieces[i])))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("digest worker thread panicked"))
            .collect()
    });

    for group in grouped {
        for (i, d) in group {
            results[i] = Some(d);
        }
    }

    results
        .into_iter()
        .map(|d| d.expect("every piece was digested"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, DedupStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DedupStore::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[test]
    fn read_after_write_round_trips() {
        let (_dir, store) = open_store();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(200);
        let written = store.write("/f", &data, 0).unwrap();
        assert_eq!(written, data.len());

        let read_back = store.read("/f", 0, data.len()).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn partial_read_returns_requested_window() {
        let (_dir, store) = open_store();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        store.write("/f", &data, 0).unwrap();

        let window = store.read("/f", 12_345, 4096).unwrap();
        assert_eq!(window, &data[12_345..12_345 + 4096]);
    }

    #[test]
    fn duplicated_halves_dedup_to_same_digests() {
        let (_dir, store) = open_store();
        let mut half = vec![0u8; 16 * 1024];
        for (i, b) in half.iter_mut().enumerate() {
            *b = (i * 7 % 251) as u8;
        }
        let mut data = half.clone();
        data.extend_from_slice(&half);

        store.write("/dup", &data, 0).unwrap();
        let manifest = store.get_all_file_chunks().remove("/dup").unwrap();
        let half_len = manifest.len() / 2;
        assert_eq!(manifest[..half_len], manifest[half_len..]);
    }

    #[test]
    fn unlink_removes_manifest_but_not_chunks_immediately() {
        let (_dir, store) = open_store();
        store.write("/f", b"hello world", 0).unwrap();
        assert!(store.exists("/f"));

        store.unlink("/f");
        assert!(!store.exists("/f"));
        assert!(matches!(store.read("/f", 0, 1), Err(DedupError::NotFound)));
    }

    #[test]
    fn read_of_missing_path_is_not_found() {
        let (_dir, store) = open_store();
        assert!(matches!(store.read("/nope", 0, 10), Err(DedupError::NotFound)));
    }
}
