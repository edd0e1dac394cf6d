//! Read-only dedup analyzer (spec §4.11): walks a directory tree, feeds
//! each file through the same [`Chunker`]/digest used by the live
//! filesystem, and reports redundancy statistics. Never touches
//! `.dedup_store/` - it is a pure client of §4.1/§4.2, same as the rest
//! of the filesystem, just without a store behind it.
//!
//! Grounded in the teacher's own single-purpose analysis binaries
//! (`src/bin/test_chunk_size.rs`): a throwaway statistics accumulator
//! built directly around the chunker and a read loop, with none of the
//! full datastore's locking or persistence.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::chunker::Chunker;
use crate::digest;

#[derive(Debug, Default)]
pub struct AnalysisReport {
    pub files_scanned: usize,
    pub total_logical_bytes: u64,
    pub total_chunks: usize,
    pub distinct_digests: usize,
    pub unique_bytes: u64,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    chunk_sizes: Vec<usize>,
}

impl AnalysisReport {
    pub fn average_chunk_size(&self) -> f64 {
        if self.total_chunks == 0 {
            0.0
        } else {
            self.total_logical_bytes as f64 / self.total_chunks as f64
        }
    }

    pub fn median_chunk_size(&self) -> usize {
        if self.chunk_sizes.is_empty() {
            return 0;
        }
        let mut sorted = self.chunk_sizes.clone();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    /// Fraction of logical bytes that were *not* unique, i.e. the bytes
    /// saved by deduplication.
    pub fn redundancy_ratio(&self) -> f64 {
        if self.total_logical_bytes == 0 {
            0.0
        } else {
            1.0 - (self.unique_bytes as f64 / self.total_logical_bytes as f64)
        }
    }

    pub fn print_summary(&self) {
        println!("files scanned:       {}", self.files_scanned);
        println!("total logical bytes: {}", self.total_logical_bytes);
        println!("total chunks:        {}", self.total_chunks);
        println!("distinct digests:    {}", self.distinct_digests);
        println!(
            "redundant chunks:    {}",
            self.total_chunks.saturating_sub(self.distinct_digests)
        );
        println!("unique bytes:        {}", self.unique_bytes);
        println!("redundancy ratio:    {:.2}%", self.redundancy_ratio() * 100.0);
        println!("average chunk size:  {:.0}", self.average_chunk_size());
        println!("min chunk size:      {}", self.min_chunk_size);
        println!("max chunk size:      {}", self.max_chunk_size);
        println!("median chunk size:   {}", self.median_chunk_size());
    }
}

/// Walks every regular file under `root`, chunking and digesting its
/// content exactly as a live write would, without storing anything.
pub fn analyze(root: &Path) -> Result<AnalysisReport> {
    let chunker = Chunker::new();
    let mut seen = HashSet::new();
    let mut report = AnalysisReport {
        min_chunk_size: usize::MAX,
        ..Default::default()
    };

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let mut file = File::open(entry.path())
            .with_context(|| format!("opening {}", entry.path().display()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .with_context(|| format!("reading {}", entry.path().display()))?;
        report.files_scanned += 1;

        let mut pos = 0usize;
        while pos < data.len() {
            let len = chunker.determine_chunk_size(&data, pos);
            let piece = &data[pos..pos + len];
            let piece_digest = digest::hash_chunk(piece);

            report.total_chunks += 1;
            report.total_logical_bytes += len as u64;
            report.min_chunk_size = report.min_chunk_size.min(len);
            report.max_chunk_size = report.max_chunk_size.max(len);
            report.chunk_sizes.push(len);

            if seen.insert(piece_digest) {
                report.unique_bytes += len as u64;
            }

            pos += len;
        }

        log::debug!("analyzed {} ({} bytes)", entry.path().display(), data.len());
    }

    report.distinct_digests = seen.len();
    if report.total_chunks == 0 {
        report.min_chunk_size = 0;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reports_full_redundancy_for_duplicate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut half = vec![0u8; 8192];
        for (i, b) in half.iter_mut().enumerate() {
            *b = (i * 13 % 251) as u8;
        }

        for name in ["a.bin", "b.bin"] {
            let mut file = File::create(dir.path().join(name)).unwrap();
            file.write_all(&half).unwrap();
        }

        let report = analyze(dir.path()).unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.total_logical_bytes, 16384);
        // every chunk from b.bin duplicates one from a.bin
        assert_eq!(report.unique_bytes, 8192);
        assert!(report.redundancy_ratio() > 0.4);
    }

    #[test]
    fn empty_directory_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let report = analyze(dir.path()).unwrap();
        assert_eq!(report.files_scanned, 0);
        assert_eq!(report.total_chunks, 0);
        assert_eq!(report.redundancy_ratio(), 0.0);
    }
}
