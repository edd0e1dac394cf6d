//! Error kinds surfaced across the chunker/store/facade boundary (spec §7).
//!
//! Most of the crate propagates errors as plain `anyhow::Error`, the same
//! way `pbs-datastore` does for anything that is only ever logged and
//! reported. `DedupError` exists for the one seam where a caller (the FUSE
//! binding) needs to match on a *kind* to pick an errno, mirroring how
//! `BlockReadError` in `pbs-tape` is a small `thiserror` enum used at
//! exactly the boundary that needs to distinguish cases programmatically.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum DedupError {
    /// No manifest exists for the requested path.
    #[error("not found")]
    NotFound,

    /// Container missing, short read, or other disk-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Manifest and chunk index disagree in a way that can't be repaired
    /// without GC; read-side inconsistencies are reported, never silently
    /// patched over.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// Lock contention timeout or similar condition the caller may retry.
    #[error("transient: {0}")]
    Transient(String),
}

impl DedupError {
    /// Maps a `DedupError` to the errno the FUSE binding should reply with.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            DedupError::NotFound => libc::ENOENT,
            DedupError::Io(_) => libc::EIO,
            DedupError::Corrupt(_) => libc::EIO,
            DedupError::Transient(_) => libc::EAGAIN,
        }
    }
}

pub type Result<T> = std::result::Result<T, DedupError>;
