//! Garbage Collector (spec §4.9): mark-and-sweep with in-place container
//! compaction.
//!
//! The phase structure (mark live digests from manifests, plan per
//! container, sweep/compact, drop, unlink, persist) and the status record
//! it produces are grounded in `pbs-datastore::datastore::DataStore`'s own
//! `garbage_collection`/`GarbageCollectionStatus` pair, translated from
//! `task_log!` narration (this crate has no task-worker abstraction) to
//! plain `log::info!`/`log::warn!` call sites.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::chunk_index::{ChunkIndex, ChunkLocation};
use crate::chunk_store::ContainerStore;
use crate::manifest::ManifestStore;

pub const DEFAULT_GC_INTERVAL_SECS: u64 = 120;

/// Summary of one GC run, mirroring `pbs-api-types::GarbageCollectionStatus`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GarbageCollectionStatus {
    pub containers_scanned: usize,
    pub containers_removed: usize,
    pub live_chunks: usize,
    pub removed_chunks: usize,
    pub removed_bytes: u64,
    pub elapsed_seconds: f64,
}

pub struct GarbageCollector {
    chunk_index: Arc<ChunkIndex>,
    manifests: Arc<ManifestStore>,
    containers: Arc<ContainerStore>,
    last_status: Mutex<Option<GarbageCollectionStatus>>,
    stop: Arc<AtomicBool>,
}

impl GarbageCollector {
    pub fn new(
        chunk_index: Arc<ChunkIndex>,
        manifests: Arc<ManifestStore>,
        containers: Arc<ContainerStore>,
    ) -> Self {
        GarbageCollector {
            chunk_index,
            manifests,
            containers,
            last_status: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn last_status(&self) -> Option<GarbageCollectionStatus> {
        self.last_status.lock().expect("gc status lock poisoned").clone()
    }

    /// Runs one mark/plan/sweep-compact/drop/unlink/persist cycle.
    pub fn run_once(&self) -> Result<GarbageCollectionStatus> {
        let start = Instant::now();
        log::info!("starting garbage collection");

        // 1. Mark: union of every manifest's digests is the live set.
        let manifests = self.manifests.all();
        let mut live: HashSet<String> = HashSet::new();
        for manifest in manifests.values() {
            for entry in manifest {
                live.insert(entry.digest.clone());
            }
        }

        // 2. Plan: partition live chunk-index entries by container.
        let index_snapshot = self.chunk_index.snapshot();
        let mut per_container: HashMap<String, Vec<(String, ChunkLocation)>> = HashMap::new();
        for (digest, location) in &index_snapshot {
            if live.contains(digest) {
                per_container
                    .entry(location.container.clone())
                    .or_default()
                    .push((digest.clone(), location.clone()));
            }
        }

        // 3. Sweep/compact each container with live entries.
        let mut new_index: HashMap<String, ChunkLocation> = HashMap::new();
        let mut containers_scanned = 0usize;

        for (container, mut entries) in per_container {
            containers_scanned += 1;
            entries.sort_by_key(|(_, location)| location.offset);

            self.containers.with_container_lock(&container, || {
                let mut compacted = Vec::new();
                let mut new_offset = 0u64;
                for (digest, location) in &entries {
                    let bytes =
                        self.containers
                            .read_unlocked(&container, location.offset, location.length)?;
                    compacted.extend_from_slice(&bytes);
                    new_index.insert(
                        digest.clone(),
                        ChunkLocation {
                            container: container.clone(),
                            offset: new_offset,
                            length: location.length,
                        },
                    );
                    new_offset += location.length as u64;
                }
                self.containers.replace_unlocked(&container, &compacted)
            })?;

            log::debug!("compacted container {container}: {} live chunks", entries.len());
        }

        // 4. Drop: anything in the old index that didn't survive into the
        // new one is dead.
        let mut removed_chunks = 0usize;
        let mut removed_bytes = 0u64;
        for (digest, location) in &index_snapshot {
            if !new_index.contains_key(digest) {
                removed_chunks += 1;
                removed_bytes += location.length as u64;
            }
        }

        // 5. Unlink containers no longer referenced at all (including ones
        // that had zero live entries and were therefore never compacted).
        let referenced: HashSet<&str> = new_index.values().map(|l| l.container.as_str()).collect();
        let mut containers_removed = 0usize;
        for container in self.containers.list_containers()? {
            if !referenced.contains(container.as_str()) {
                self.containers
                    .with_container_lock(&container, || self.containers.delete_unlocked(&container))?;
                containers_removed += 1;
                log::debug!("removed dead container {container}");
            }
        }

        // 6. Persist the rebuilt chunk index.
        let live_chunks = new_index.len();
        self.chunk_index.replace_all(new_index);

        let status = GarbageCollectionStatus {
            containers_scanned,
            containers_removed,
            live_chunks,
            removed_chunks,
            removed_bytes,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        };

        log::info!(
            "garbage collection done: {} containers scanned, {} live chunks, {} chunks removed \
             ({} bytes), {} containers removed, {:.2}s",
            status.containers_scanned,
            status.live_chunks,
            status.removed_chunks,
            status.removed_bytes,
            status.containers_removed,
            status.elapsed_seconds,
        );

        *self.last_status.lock().expect("gc status lock poisoned") = Some(status.clone());
        Ok(status)
    }

    /// Spawns a background thread that runs [`Self::run_once`] every
    /// `interval`, until [`Self::request_stop`] is called.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("gc".to_string())
            .spawn(move || {
                while !self.stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(err) = self.run_once() {
                        log::warn!("garbage collection cycle failed: {err:#}");
                    }
                }
            })
            .expect("failed to spawn garbage collector thread")
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;

    fn build(dir: &std::path::Path) -> (Arc<ChunkIndex>, Arc<ManifestStore>, Arc<ContainerStore>) {
        let chunk_index = Arc::new(ChunkIndex::load_or_create(dir.join("chunk_metadata.json")).unwrap());
        let manifests = Arc::new(ManifestStore::load_or_create(dir.join("file_chunks.json")).unwrap());
        let containers = Arc::new(ContainerStore::open(dir.join(".dedup_store")).unwrap());
        (chunk_index, manifests, containers)
    }

    #[test]
    fn drops_unreferenced_container() {
        let dir = tempfile::tempdir().unwrap();
        let (chunk_index, manifests, containers) = build(dir.path());

        let offset = containers.append("dead.container", b"deadbeef").unwrap();
        chunk_index.insert(
            "deaddigest".into(),
            ChunkLocation {
                container: "dead.container".into(),
                offset,
                length: 8,
            },
        );
        // No manifest references "deaddigest".

        let gc = GarbageCollector::new(chunk_index.clone(), manifests, containers.clone());
        let status = gc.run_once().unwrap();

        assert_eq!(status.removed_chunks, 1);
        assert_eq!(status.containers_removed, 1);
        assert!(!chunk_index.exists("deaddigest"));
        assert!(containers.list_containers().unwrap().is_empty());
    }

    #[test]
    fn compacts_container_keeping_live_chunk_readable() {
        let dir = tempfile::tempdir().unwrap();
        let (chunk_index, manifests, containers) = build(dir.path());

        let live_off = containers.append("f.container", b"LIVEDATA").unwrap();
        let dead_off = containers.append("f.container", b"DEADDATA").unwrap();

        chunk_index.insert(
            "live".into(),
            ChunkLocation { container: "f.container".into(), offset: live_off, length: 8 },
        );
        chunk_index.insert(
            "dead".into(),
            ChunkLocation { container: "f.container".into(), offset: dead_off, length: 8 },
        );
        manifests.put(
            "/f".to_string(),
            vec![ManifestEntry { digest: "live".into(), length: 8 }],
        );

        let gc = GarbageCollector::new(chunk_index.clone(), manifests, containers.clone());
        let status = gc.run_once().unwrap();

        assert_eq!(status.live_chunks, 1);
        assert_eq!(status.removed_chunks, 1);

        let new_loc = chunk_index.lookup("live").unwrap();
        assert_eq!(
            containers.read(&new_loc.container, new_loc.offset, new_loc.length).unwrap(),
            b"LIVEDATA"
        );
        assert!(!chunk_index.exists("dead"));
    }
}
