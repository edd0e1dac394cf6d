//! Content-defined chunk boundary detector.
//!
//! This is a rewrite, in Rust, of a rolling polynomial hash (CRC-like,
//! byte-table driven) boundary finder. Unlike the teacher crate's Buzhash
//! chunker, which rolls a single persistent window across an entire
//! streamed archive, this chunker is **stateless across calls**: each
//! `determine_chunk_size` call builds its own window/hash from scratch.
//! That is a deliberate simplification - splitting one write into several
//! `write()` calls at different byte offsets changes where boundaries
//! fall, because nothing is carried over between calls.

use lazy_static::lazy_static;

/// Sliding window size, in bytes.
pub const WINDOW_SIZE: usize = 48;

/// Rolling hash polynomial (56-bit CRC-like constant).
pub const POLYNOMIAL: u64 = 0x3DA3358B4DC173;

/// A boundary is declared when `hash & TARGET_MASK == 0`; this mask yields
/// an expected chunk size of roughly 4 KiB.
pub const TARGET_MASK: u64 = 0xFFF;

/// Smallest allowed chunk, unless the remaining data itself is shorter.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest allowed chunk; a boundary is forced here if none was found.
pub const MAX_CHUNK_SIZE: usize = 16384;

/// Mask restricting the rolling hash to a 56-bit domain.
const MASK56: u64 = 0x00FF_FFFF_FFFF_FFFF;

lazy_static! {
    static ref TABLE: [u64; 256] = precompute_table();
}

fn precompute_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut hash_val = i as u64;
        for _ in 0..8 {
            if hash_val & 1 != 0 {
                hash_val = (hash_val >> 1) ^ POLYNOMIAL;
            } else {
                hash_val >>= 1;
            }
        }
        *slot = hash_val;
    }
    table
}

/// Rolling-hash chunk boundary finder.
///
/// Holds no per-instance state; every call is independent. Kept as a
/// zero-sized type (rather than a bare free function) so call sites read
/// the same way the teacher's `Chunker` does, and so a future stateful
/// variant could be swapped in without touching callers.
#[derive(Default, Clone, Copy)]
pub struct Chunker;

impl Chunker {
    pub fn new() -> Self {
        Chunker
    }

    /// Scans `data[start..]` and returns the length of the next chunk.
    ///
    /// Always satisfies `MIN_CHUNK_SIZE <= L <= min(MAX_CHUNK_SIZE,
    /// data.len() - start)`, except when fewer than `MIN_CHUNK_SIZE` bytes
    /// remain, in which case `L` is exactly the remaining length.
    pub fn determine_chunk_size(&self, data: &[u8], start: usize) -> usize {
        let len = data.len();
        if start >= len {
            return 0;
        }

        let end = (start + MAX_CHUNK_SIZE).min(len);
        let window_fill = WINDOW_SIZE.min(len - start);

        let mut window = [0u8; WINDOW_SIZE];
        let mut hash: u64 = 0;
        let mut window_pos = 0usize;

        // Prime the window; boundaries are never tested during priming.
        for &byte in &data[start..start + window_fill] {
            Self::roll(&mut window, &mut hash, &mut window_pos, byte);
        }

        // Deliberately skip from `window_fill` straight to
        // `max(window_fill, MIN_CHUNK_SIZE)`: bytes in between never pass
        // through the rolling window. This reproduces the reference
        // implementation's behavior exactly (see DESIGN.md) rather than
        // "fixing" it into a contiguous rolling scan.
        let mut i = start + window_fill.max(MIN_CHUNK_SIZE);
        while i < end {
            Self::roll(&mut window, &mut hash, &mut window_pos, data[i]);
            if hash & TARGET_MASK == 0 {
                return i - start;
            }
            i += 1;
        }

        end - start
    }

    #[inline]
    fn roll(window: &mut [u8; WINDOW_SIZE], hash: &mut u64, window_pos: &mut usize, byte: u8) {
        let dropped = window[*window_pos];
        window[*window_pos] = byte;
        *window_pos = (*window_pos + 1) % WINDOW_SIZE;
        *hash = ((*hash << 8) & MASK56) ^ TABLE[byte as usize] ^ TABLE[dropped as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_shorter_than_remaining_when_remaining_is_short() {
        let data = vec![0u8; 500];
        let chunker = Chunker::new();
        assert_eq!(chunker.determine_chunk_size(&data, 0), 500);
    }

    #[test]
    fn never_exceeds_max_chunk_size() {
        let data = vec![0u8; MAX_CHUNK_SIZE * 4];
        let chunker = Chunker::new();
        let len = chunker.determine_chunk_size(&data, 0);
        assert!(len <= MAX_CHUNK_SIZE);
        assert!(len >= MIN_CHUNK_SIZE);
    }

    #[test]
    fn deterministic_across_repeated_calls() {
        let mut data = vec![0u8; 200_000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i * 2654435761u64 % 251) as u8;
        }
        let chunker = Chunker::new();
        let a = chunker.determine_chunk_size(&data, 0);
        let b = chunker.determine_chunk_size(&data, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_across_threads() {
        let mut data = vec![0u8; 1024 * 1024];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i * 2654435761u64 % 251) as u8;
        }
        let data = std::sync::Arc::new(data);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let data = data.clone();
            handles.push(std::thread::spawn(move || {
                let chunker = Chunker::new();
                let mut boundaries = Vec::new();
                let mut start = 0;
                while start < data.len() {
                    let len = chunker.determine_chunk_size(&data, start);
                    boundaries.push(len);
                    start += len;
                }
                boundaries
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
    }

    #[test]
    fn average_chunk_size_within_tolerance() {
        let mut data = vec![0u8; 4 * 1024 * 1024];
        let mut state: u64 = 0x243F_6A88_85A3_08D3;
        for b in data.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = (state & 0xff) as u8;
        }

        let chunker = Chunker::new();
        let mut start = 0;
        let mut count = 0usize;
        while start < data.len() {
            let len = chunker.determine_chunk_size(&data, start);
            start += len;
            count += 1;
        }
        let avg = data.len() / count;
        assert!(avg > 3072 && avg < 5120, "average chunk size was {avg}");
    }
}
