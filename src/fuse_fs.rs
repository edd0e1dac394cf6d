//! Minimal FUSE binding (spec §4.10): translates kernel VFS requests into
//! reads against [`DedupStore`], passing `lookup`/`getattr`/`readdir`
//! straight through to the backing directory for anything that isn't file
//! content.
//!
//! `proxmox-fuse` only exposes a read-side request surface (`Lookup`,
//! `Getattr`, `ReaddirPlus`, `Read`, `Readlink`, the xattr requests, and a
//! catch-all `Other`) - there is no kernel-originated create/write/unlink
//! request to answer. Both of the crate's own bindings in the examples pack
//! (`pbs-fuse-loop::fuse_loop::FuseLoopSession::main`, `pbs-pxar-fuse`) are
//! read-only for exactly this reason, and this mount follows them: it is a
//! read-only view of whatever `DedupStore` already holds. `DedupStore`'s
//! `write`/`create`/`unlink` (spec §4.8/§4.10) remain fully implemented and
//! exercised directly - by the `dedupfs` CLI and by `datastore.rs`'s own
//! tests - just not reachable through a live mount.
//!
//! Grounded in `pbs-fuse-loop::fuse_loop::FuseLoopSession::main`'s request
//! loop shape and `pbs-pxar-fuse::lib.rs`'s builder chain, field access, and
//! `ReaddirPlus` reply idiom.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::stream::TryStreamExt;
use proxmox_fuse::{EntryParam, Fuse, ReplyBufState, Request};

use crate::datastore::DedupStore;

const ROOT_INODE: u64 = 1;
const ATTR_TTL: f64 = 1.0;

/// Bijection between FUSE inode numbers and backing-root-relative paths.
/// The binding is thin enough that this is the only VFS-shaped state it
/// needs to keep; everything else is delegated to `DedupStore` or the
/// backing directory.
struct InodeTable {
    paths: HashMap<u64, PathBuf>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_INODE, PathBuf::from("/"));
        InodeTable {
            paths,
            next: ROOT_INODE + 1,
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn intern(&mut self, path: PathBuf) -> u64 {
        if let Some((&ino, _)) = self.paths.iter().find(|(_, p)| **p == path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path);
        ino
    }
}

pub struct DedupFilesystem {
    store: Arc<DedupStore>,
    root: PathBuf,
    inodes: Mutex<InodeTable>,
}

impl DedupFilesystem {
    pub fn new(store: Arc<DedupStore>) -> Self {
        let root = store.root().to_path_buf();
        DedupFilesystem {
            store,
            root,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn backing_path(&self, logical: &Path) -> PathBuf {
        let relative = logical.strip_prefix("/").unwrap_or(logical);
        self.root.join(relative)
    }

    fn logical_path_string(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    /// Attribute stub: everything but `st_size` is delegated to the
    /// backing host filesystem (spec §1/§4.10 passthrough); `st_size`
    /// comes from the manifest when one exists, since it is the
    /// authoritative logical length.
    fn stat_for(&self, logical: &Path) -> std::io::Result<libc::stat> {
        let backing = self.backing_path(logical);
        let meta = fs::metadata(&backing)?;
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        stat.st_mode = if meta.is_dir() {
            libc::S_IFDIR | 0o755
        } else {
            libc::S_IFREG | 0o644
        };
        stat.st_nlink = 1;
        stat.st_size = self
            .store
            .file_size(&Self::logical_path_string(logical))
            .unwrap_or(meta.len()) as i64;
        Ok(stat)
    }

    fn path_for_inode(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.lock().expect("inode table poisoned").path_of(ino)
    }

    fn intern_path(&self, path: PathBuf) -> u64 {
        self.inodes.lock().expect("inode table poisoned").intern(path)
    }

    /// Runs the FUSE request loop until the kernel closes the connection.
    pub async fn run(self, mountpoint: &Path) -> Result<()> {
        let fuse = Fuse::builder("dedupfs")?
            .enable_read()
            .enable_readdirplus()
            .build()
            .context("building FUSE session")?
            .mount(mountpoint)
            .with_context(|| format!("mounting at {}", mountpoint.display()))?;

        let mut session = fuse.fuse();
        while let Some(request) = session.try_next().await? {
            if let Err(err) = self.dispatch(request).await {
                log::warn!("FUSE request failed: {err:#}");
            }
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<()> {
        match request {
            Request::Lookup(req) => {
                let Some(parent) = self.path_for_inode(req.parent) else {
                    return Ok(req.fail(libc::ENOENT)?);
                };
                let child = parent.join(&req.file_name);
                match self.stat_for(&child) {
                    Ok(stat) => {
                        let ino = self.intern_path(child);
                        Ok(req.reply(&EntryParam::simple(ino, stat))?)
                    }
                    Err(_) => Ok(req.fail(libc::ENOENT)?),
                }
            }
            Request::Getattr(req) => match self.path_for_inode(req.inode) {
                Some(path) => match self.stat_for(&path) {
                    Ok(stat) => Ok(req.reply(&stat, ATTR_TTL)?),
                    Err(_) => Ok(req.fail(libc::ENOENT)?),
                },
                None => Ok(req.fail(libc::ENOENT)?),
            },
            Request::ReaddirPlus(mut req) => {
                let Some(path) = self.path_for_inode(req.inode) else {
                    return Ok(req.fail(libc::ENOENT)?);
                };
                let backing = self.backing_path(&path);
                let offset = usize::try_from(req.offset).unwrap_or(0);
                let mut next = offset as isize;
                if let Ok(read_dir) = fs::read_dir(&backing) {
                    for entry in read_dir.flatten().skip(offset) {
                        next += 1;
                        let name = entry.file_name();
                        let child = path.join(&name);
                        let stat = match self.stat_for(&child) {
                            Ok(stat) => stat,
                            Err(_) => continue,
                        };
                        match req.add_entry(&name, &stat, next, 1, ATTR_TTL, ATTR_TTL)? {
                            ReplyBufState::Ok => {
                                self.intern_path(child);
                            }
                            ReplyBufState::Full => break,
                        }
                    }
                }
                Ok(req.reply()?)
            }
            Request::Read(req) => {
                let Some(path) = self.path_for_inode(req.inode) else {
                    return Ok(req.fail(libc::ENOENT)?);
                };
                match self
                    .store
                    .read(&Self::logical_path_string(&path), req.offset, req.size)
                {
                    Ok(data) => Ok(req.reply(&data)?),
                    Err(err) => Ok(req.fail(err.to_errno())?),
                }
            }
            other => {
                log::debug!("unhandled FUSE request type");
                Ok(other.fail(libc::ENOSYS)?)
            }
        }
    }
}
