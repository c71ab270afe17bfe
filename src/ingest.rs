//! Parallel parse of the input into the cell table.
//!
//! The input is cut into one contiguous range per parser thread. Every cut is
//! moved forward past the next newline so no record straddles two ranges.
//! Threads share nothing but the table (and an abort flag): the table's final
//! content is a set, so it does not depend on thread count or scheduling.

use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use tracing::{debug, info_span, trace};

use crate::cell::{KEY_SPACE, Point};
use crate::error::ParseError;
use crate::parse::Records;
use crate::table::ChunkedTable;

/// Shortest possible record, `0.0 0.0 0.0\n`.
const MIN_RECORD_BYTES: usize = 12;

/// Upper bound on the number of distinct cells an input of `bytes` can fill.
pub fn estimate_keys(bytes: usize) -> usize {
    (bytes / MIN_RECORD_BYTES).min(KEY_SPACE as usize)
}

/// Split `input` into `parts` newline-aligned ranges covering all of it.
/// Trailing ranges may be empty when the input has few records.
pub fn split_ranges(input: &[u8], parts: usize) -> Vec<Range<usize>> {
    let parts = parts.max(1);
    let len = input.len();
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 1..=parts {
        let end = if i == parts {
            len
        } else {
            let cut = (len * i / parts).max(start);
            match input[cut..].iter().position(|&b| b == b'\n') {
                Some(nl) => cut + nl + 1,
                None => len,
            }
        };
        ranges.push(start..end);
        start = end;
    }
    ranges
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    /// Records parsed and inserted.
    pub records: usize,
}

/// Remembers the earliest error reported by any parser thread and tells the
/// others to stop.
struct Abort {
    flag: AtomicBool,
    error: Mutex<Option<ParseError>>,
}

impl Abort {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    #[inline(always)]
    fn raised(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn raise(&self, error: ParseError) {
        self.flag.store(true, Ordering::Relaxed);
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        match *slot {
            Some(prev) if prev.offset <= error.offset => {}
            _ => *slot = Some(error),
        }
    }

    fn into_result(self) -> Result<(), ParseError> {
        match self.error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Parse `input` with `threads` parser threads, inserting every point into
/// `table` under its cell key.
///
/// A malformed record stops every thread and is returned; in that case the
/// table holds an arbitrary subset of the input and must be discarded.
pub fn ingest(input: &[u8], table: &ChunkedTable, threads: usize) -> Result<IngestStats, ParseError> {
    let _span = info_span!("ingest", threads, bytes = input.len()).entered();
    let started = Instant::now();
    let abort = Abort::new();
    let ranges = split_ranges(input, threads);

    let records: usize = thread::scope(|s| {
        let handles: Vec<_> = ranges
            .iter()
            .enumerate()
            .map(|(t, range)| {
                let abort = &abort;
                let chunk = &input[range.clone()];
                let base = range.start;
                s.spawn(move || {
                    let mut n: usize = 0;
                    for record in Records::new(chunk) {
                        if abort.raised() {
                            break;
                        }
                        match record {
                            Ok(point) => {
                                table.insert(point.key(), point);
                                n += 1;
                            }
                            Err(e) => abort.raise(e.shifted(base)),
                        }
                    }
                    trace!(thread = t, records = n, "parser done");
                    n
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
            .sum()
    });

    abort.into_result()?;
    debug!(
        records,
        cells = table.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "ingest complete"
    );
    Ok(IngestStats { records })
}

/// Parse `input` with `threads` parser threads into a flat point list in
/// input order. Used by the grid and k-d tree indices.
pub fn parse_parallel(input: &[u8], threads: usize) -> Result<Vec<Point>, ParseError> {
    let _span = info_span!("parse", threads, bytes = input.len()).entered();
    let abort = Abort::new();
    let ranges = split_ranges(input, threads);

    let parts: Vec<Vec<Point>> = thread::scope(|s| {
        let handles: Vec<_> = ranges
            .iter()
            .map(|range| {
                let abort = &abort;
                let chunk = &input[range.clone()];
                let base = range.start;
                s.spawn(move || {
                    let mut points = Vec::with_capacity(chunk.len() / MIN_RECORD_BYTES / 2);
                    for record in Records::new(chunk) {
                        if abort.raised() {
                            break;
                        }
                        match record {
                            Ok(point) => points.push(point),
                            Err(e) => abort.raise(e.shifted(base)),
                        }
                    }
                    points
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
            .collect()
    });

    abort.into_result()?;
    Ok(parts.concat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseErrorKind;
    use crate::parse::parse_points;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn synthetic_input(n: usize, seed: u64) -> String {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut out = String::new();
        for _ in 0..n {
            for axis in 0..3 {
                let v: f32 = rng.random_range(-2.0..2.0);
                if axis > 0 {
                    out.push(' ');
                }
                out.push_str(&format!("{v:.4}"));
            }
            out.push('\n');
        }
        out
    }

    #[test]
    fn ranges_cover_input_on_line_boundaries() {
        let input = synthetic_input(1_000, 3);
        let bytes = input.as_bytes();
        for parts in [1, 2, 3, 7, 8, 33] {
            let ranges = split_ranges(bytes, parts);
            assert_eq!(ranges.len(), parts);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges.last().unwrap().end, bytes.len());
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
                let cut = pair[0].end;
                assert!(cut == 0 || cut == bytes.len() || bytes[cut - 1] == b'\n');
            }
        }
    }

    #[test]
    fn more_threads_than_records() {
        let input = b"1.0 1.0 1.0\n2.0 2.0 2.0\n";
        let ranges = split_ranges(input, 8);
        let non_empty = ranges.iter().filter(|r| !r.is_empty()).count();
        assert!(non_empty <= 2);

        let table = ChunkedTable::with_capacity(4);
        let stats = ingest(input, &table, 8).unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn empty_input() {
        let table = ChunkedTable::with_capacity(0);
        assert_eq!(ingest(b"", &table, 4).unwrap().records, 0);
        assert!(table.is_empty());
        assert!(parse_parallel(b"", 4).unwrap().is_empty());
    }

    #[test]
    fn ingest_is_complete_for_any_thread_count() {
        let input = synthetic_input(5_000, 11);
        let expected = parse_points(input.as_bytes()).unwrap();
        for threads in [1, 2, 8, 33] {
            let table = ChunkedTable::with_capacity(estimate_keys(input.len()));
            let stats = ingest(input.as_bytes(), &table, threads).unwrap();
            assert_eq!(stats.records, expected.len());
            let table = table.freeze();
            assert_eq!(table.point_count(), expected.len(), "threads={threads}");
        }
    }

    #[test]
    fn ingest_content_is_thread_count_invariant() {
        let input = synthetic_input(3_000, 5);
        let snapshot = |threads| {
            let table = ChunkedTable::with_capacity(1024);
            ingest(input.as_bytes(), &table, threads).unwrap();
            let table = table.freeze();
            let mut cells: Vec<(u64, Vec<u32>)> = table
                .keys()
                .into_iter()
                .map(|key| {
                    let mut bits: Vec<u32> = table
                        .lookup(key)
                        .unwrap()
                        .flatten()
                        .flat_map(|p| [p.x().to_bits(), p.y().to_bits(), p.z().to_bits()])
                        .collect();
                    bits.sort();
                    (key, bits)
                })
                .collect();
            cells.sort();
            cells
        };
        let single = snapshot(1);
        for threads in [2, 8, 33] {
            assert_eq!(snapshot(threads), single, "threads={threads}");
        }
    }

    #[test]
    fn parse_parallel_preserves_order() {
        let input = synthetic_input(2_000, 9);
        let expected = parse_points(input.as_bytes()).unwrap();
        for threads in [1, 3, 8] {
            assert_eq!(parse_parallel(input.as_bytes(), threads).unwrap(), expected);
        }
    }

    #[test]
    fn malformed_record_aborts_with_absolute_offset() {
        let mut input = synthetic_input(1_000, 2);
        let bad_at = input.len();
        input.push_str("1.0 2.0 x\n");
        input.push_str(&synthetic_input(10, 4));

        for threads in [1, 4] {
            let table = ChunkedTable::with_capacity(1024);
            let err = ingest(input.as_bytes(), &table, threads).unwrap_err();
            assert_eq!(err.kind, ParseErrorKind::MissingDigit);
            assert_eq!(err.offset, bad_at + 8);

            let err = parse_parallel(input.as_bytes(), threads).unwrap_err();
            assert_eq!(err.offset, bad_at + 8);
        }
    }

    #[test]
    fn estimate_is_bounded_by_key_space() {
        assert_eq!(estimate_keys(120), 10);
        assert_eq!(estimate_keys(usize::MAX), KEY_SPACE as usize);
    }
}
