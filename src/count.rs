//! Parallel close-pair counting over the frozen cell table.
//!
//! Counter threads claim `stride` keys at a time from a shared cursor (index
//! stealing), so a thread stuck on a dense cell does not hold up the rest of a
//! static partition. Each claimed cell is compared against itself and its 13
//! forward neighbours in [`HALF_STENCIL`]; every unordered pair of points is
//! examined exactly once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use tracing::{debug, info_span, trace};

use crate::cell::{HALF_STENCIL, Point, neighbour};
use crate::table::{ChunkList, FrozenTable};

/// Close pairs between `a` and every point of `points`.
#[inline(always)]
fn close_to(a: &Point, points: &[Point]) -> u64 {
    points.iter().filter(|b| a.is_close(b)).count() as u64
}

/// Pairs with both points in one cell.
fn count_within_cell(mut chunks: ChunkList<'_>) -> u64 {
    let mut pairs = 0;
    while let Some(chunk) = chunks.next() {
        for (n, a) in chunk.iter().enumerate() {
            // m > n inside the chunk, then everything in older chunks.
            pairs += close_to(a, &chunk[n + 1..]);
            for older in chunks.clone() {
                pairs += close_to(a, older);
            }
        }
    }
    pairs
}

/// Pairs found from `key`'s cell: those inside it and those with a forward
/// neighbour.
fn count_cell(table: &FrozenTable, key: u64) -> u64 {
    let Some(own) = table.lookup(key) else {
        return 0;
    };
    let mut pairs = count_within_cell(own.clone());

    for &delta in &HALF_STENCIL {
        let Some(other) = table.lookup(neighbour(key, delta)) else {
            continue;
        };
        for chunk in own.clone() {
            for a in chunk {
                for points in other.clone() {
                    pairs += close_to(a, points);
                }
            }
        }
    }
    pairs
}

/// Count close pairs in `table`, whose distinct keys are `keys`, with
/// `threads` counter threads claiming `stride` keys at a time.
pub fn count_pairs(table: &FrozenTable, keys: &[u64], threads: usize, stride: usize) -> u64 {
    let _span = info_span!("count", threads, stride, cells = keys.len()).entered();
    let started = Instant::now();
    // Past the key count a bigger stride claims nothing more, and keeping the
    // cursor small stops `fetch_add` from wrapping back to zero.
    let stride = stride.clamp(1, keys.len().max(1));
    let cursor = AtomicUsize::new(0);
    let total = AtomicU64::new(0);

    thread::scope(|s| {
        for t in 0..threads.max(1) {
            let cursor = &cursor;
            let total = &total;
            s.spawn(move || {
                let mut local: u64 = 0;
                let mut claimed: usize = 0;
                loop {
                    let start = cursor.fetch_add(stride, Ordering::Relaxed);
                    if start >= keys.len() {
                        break;
                    }
                    let end = (start + stride).min(keys.len());
                    for &key in &keys[start..end] {
                        local += count_cell(table, key);
                    }
                    claimed += end - start;
                }
                total.fetch_add(local, Ordering::Relaxed);
                trace!(thread = t, cells = claimed, pairs = local, "counter done");
            });
        }
    });

    let pairs = total.into_inner();
    debug!(pairs, elapsed_us = started.elapsed().as_micros() as u64, "count complete");
    pairs
}

/// O(n²) reference count.
pub fn brute_force(points: &[Point]) -> u64 {
    let mut pairs = 0;
    for (i, a) in points.iter().enumerate() {
        pairs += close_to(a, &points[i + 1..]);
    }
    pairs
}
