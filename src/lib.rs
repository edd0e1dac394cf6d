//! This crate implements a user-space deduplicating filesystem: a content
//! defined chunker, a content-addressed chunk store, and a mark-and-sweep
//! garbage collector, glued together by a thin FUSE binding.
//!
//! # Data model
//!
//! Every file is represented as a [`manifest::Manifest`]: an ordered list
//! of `(digest, length)` pairs. The bytes behind each digest live exactly
//! once, in a [`chunk_store::ContainerStore`] container file, located via
//! the [`chunk_index::ChunkIndex`]. Concatenating a manifest's chunks in
//! order reconstructs the file's contents; nothing else needs to know
//! where those bytes physically live.
//!
//! A [`chunker::Chunker`] decides where one chunk ends and the next
//! begins, from the content itself rather than from fixed offsets, so
//! that inserting or deleting a few bytes near the start of a file does
//! not shift every following chunk's boundary - only the chunks actually
//! touched by the edit change digest.
//!
//! # Garbage collection
//!
//! Deleting a file (`unlink`) only removes its manifest; this is cheap
//! and instant, but it does not reclaim storage, since other manifests
//! may reference the same chunks. [`gc::GarbageCollector`] reclaims that
//! storage on a timer (or on demand): it unions every manifest's digests
//! into a live set, then rewrites each container in place keeping only
//! the chunk ranges still in that set, and finally drops any container
//! left with nothing live in it.
//!
//! Unlike an `atime`-based collector, this design keeps the live set
//! entirely in memory from manifest snapshots rather than inferring it
//! from filesystem access times - there is exactly one kind of file here
//! (a manifest entry) that marks a chunk live, not backup-index files
//! scattered across a tree of snapshots.
//!
//! # Locking
//!
//! - One reentrant lock per logical path, guarding that path's manifest
//!   and its container's writes - see [`datastore::DedupStore`].
//! - One lock per container file, held by whichever writer or GC pass is
//!   touching it - see [`chunk_store::ContainerStore::with_container_lock`].
//! - A reader/writer lock around each of the in-memory Chunk Index and
//!   Manifest Store maps, with a background thread persisting both to
//!   disk - see [`persist::Persister`].
//!
//! GC and writers never contend on more than one container at a time:
//! a writer only ever touches the container for the path it holds the
//! lock for, and GC takes each container's lock in turn while compacting
//! it, so the two naturally serialize per container without a global
//! lock.

pub mod chunk_index;
pub mod chunk_store;
pub mod chunker;
pub mod digest;
pub mod error;
pub mod gc;
pub mod manifest;
pub mod persist;

pub mod analyze;
pub mod datastore;
pub mod fuse_fs;

pub use chunker::Chunker;
pub use datastore::DedupStore;
pub use error::{DedupError, Result as DedupResult};
pub use fuse_fs::DedupFilesystem;
pub use gc::{GarbageCollectionStatus, GarbageCollector};
