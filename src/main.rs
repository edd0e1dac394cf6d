//! CLI entry point (spec §6).
//!
//! `dedupfs <mountpoint> <rootpoint>` mounts a deduplicating view of
//! `rootpoint` at `mountpoint`. `dedupfs analyze <path>` and `dedupfs gc
//! <rootpoint>` run the read-only analyzer and a single on-demand GC cycle
//! respectively, without mounting anything. There is no config file: the
//! compiled-in tunables in `chunker`/`gc` and this CLI surface are the only
//! configuration there is.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use dedupfs::datastore::DedupStore;
use dedupfs::fuse_fs::DedupFilesystem;
use dedupfs::gc::DEFAULT_GC_INTERVAL_SECS;

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    if let Err(err) = run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);

    match args.next() {
        Some(cmd) if cmd == "analyze" => {
            let path = args.next().context("usage: dedupfs analyze <path>")?;
            run_analyze(PathBuf::from(path))
        }
        Some(cmd) if cmd == "gc" => {
            let rootpoint = args.next().context("usage: dedupfs gc <rootpoint>")?;
            run_gc(PathBuf::from(rootpoint))
        }
        Some(mountpoint) => {
            let rootpoint = args
                .next()
                .context("usage: dedupfs <mountpoint> <rootpoint>")?;
            run_mount(PathBuf::from(mountpoint), PathBuf::from(rootpoint))
        }
        None => bail!("usage: dedupfs <mountpoint> <rootpoint>\n       dedupfs analyze <path>\n       dedupfs gc <rootpoint>"),
    }
}

fn run_analyze(path: PathBuf) -> Result<()> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    let report = dedupfs::analyze::analyze(&path)?;
    report.print_summary();
    Ok(())
}

fn run_gc(rootpoint: PathBuf) -> Result<()> {
    if !rootpoint.is_dir() {
        bail!("{} is not a directory", rootpoint.display());
    }
    let store = DedupStore::open(rootpoint)?;
    let status = store.gc().run_once()?;
    log::info!("{status:?}");
    Ok(())
}

fn run_mount(mountpoint: PathBuf, rootpoint: PathBuf) -> Result<()> {
    if !mountpoint.is_dir() {
        bail!("{} is not a directory", mountpoint.display());
    }
    if !rootpoint.is_dir() {
        bail!("{} is not a directory", rootpoint.display());
    }

    let store = Arc::new(DedupStore::open(rootpoint)?);

    let gc = store.gc();
    gc.clone().spawn_periodic(Duration::from_secs(DEFAULT_GC_INTERVAL_SECS));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let fs = DedupFilesystem::new(store);
        fs.run(&mountpoint).await
    })
}
