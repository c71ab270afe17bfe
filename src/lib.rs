//! Fixed-radius close-pair counting over large 3-d point clouds.
//!
//! ```text
//!  bytes ──► parser threads ──► ChunkedTable ──freeze──► keys ──► counter threads ──► u64
//!            (ingest)           (lock-free)              (enumerate)  (index stealing)
//! ```
//!
//! [`count_close_pairs`] runs the whole pipeline with the index selected in
//! [`CountConfig`]. The grid and k-d tree indices are simpler baselines that
//! produce the same count.

pub mod cell;
pub mod config;
pub mod count;
pub mod error;
pub mod grid;
pub mod ingest;
pub mod kdtree;
pub mod parse;
pub mod table;

use tracing::info_span;

pub use cell::{CELL_SIZE, Point, THRESHOLD};
pub use config::{ConfigOverrides, CountConfig, IndexKind};
pub use error::{Error, ParseError, ParseErrorKind, Result};

use crate::grid::Grid;
use crate::ingest::{estimate_keys, ingest, parse_parallel};
use crate::kdtree::KdTree;
use crate::table::ChunkedTable;

/// Count the unordered pairs of records in `input` that lie within
/// [`THRESHOLD`] of each other.
///
/// Any malformed record fails the whole run; no partial count is returned.
pub fn count_close_pairs(input: &[u8], config: &CountConfig) -> Result<u64> {
    config.validate()?;
    let pairs = match config.index {
        IndexKind::Chunked => count_chunked(input, config)?,
        IndexKind::Grid => {
            let points = parse_parallel(input, config.parser_threads)?;
            Grid::build(points).count_pairs(config.counter_threads)
        }
        IndexKind::KdTree => {
            let points = parse_parallel(input, config.parser_threads)?;
            KdTree::build(&points).count_pairs()
        }
    };
    Ok(pairs)
}

fn count_chunked(input: &[u8], config: &CountConfig) -> Result<u64> {
    let capacity = config
        .table_capacity
        .unwrap_or_else(|| estimate_keys(input.len()));
    let table = ChunkedTable::with_capacity(capacity);
    ingest(input, &table, config.parser_threads)?;
    let table = table.freeze();

    let keys = {
        let _span = info_span!("enumerate", cells = table.len()).entered();
        table.keys()
    };
    Ok(count::count_pairs(
        &table,
        &keys,
        config.counter_threads,
        config.steal_stride,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    const INDICES: [IndexKind; 3] = [IndexKind::Chunked, IndexKind::Grid, IndexKind::KdTree];

    fn cloud_text(n: usize, seed: u64) -> String {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut out = String::new();
        for i in 0..n {
            let [x, y, z]: [f32; 3] = std::array::from_fn(|_| rng.random_range(-0.8..0.8));
            // Mix plain and scientific literals.
            if i % 5 == 0 {
                out.push_str(&format!("{x:.5} {:.4e} {z:.5}\n", y / 10.0));
            } else {
                out.push_str(&format!("{x:.5} {y:.5} {z:.5}\n"));
            }
        }
        out
    }

    #[test]
    fn all_indices_agree() {
        let input = cloud_text(3_000, 8);
        let expected = count::brute_force(&parse::parse_points(input.as_bytes()).unwrap());
        assert!(expected > 0);
        for index in INDICES {
            for (p, c) in [(1, 1), (3, 8)] {
                let config = CountConfig::default().with_threads(p, c).with_index(index);
                assert_eq!(
                    count_close_pairs(input.as_bytes(), &config).unwrap(),
                    expected,
                    "{index:?} parsers={p} counters={c}"
                );
            }
        }
    }

    #[test]
    fn empty_input_has_no_pairs() {
        for index in INDICES {
            let config = CountConfig::default().with_index(index);
            assert_eq!(count_close_pairs(b"", &config).unwrap(), 0);
        }
    }

    #[test]
    fn explicit_capacity_is_only_a_hint() {
        let input = cloud_text(500, 1);
        let mut config = CountConfig::default();
        let baseline = count_close_pairs(input.as_bytes(), &config).unwrap();
        config.table_capacity = Some(0);
        assert_eq!(count_close_pairs(input.as_bytes(), &config).unwrap(), baseline);
    }

    #[test]
    fn malformed_input_fails_every_index() {
        let mut input = cloud_text(100, 2);
        input.push_str("1.0 2.0 10.0\n");
        for index in INDICES {
            let config = CountConfig::default().with_threads(4, 4).with_index(index);
            let err = count_close_pairs(input.as_bytes(), &config).unwrap_err();
            assert!(
                matches!(err, Error::Parse(ParseError { kind: ParseErrorKind::MissingDecimalPoint, .. })),
                "{index:?}: {err}"
            );
        }
    }

    #[test]
    fn invalid_config_is_rejected_before_work() {
        let config = CountConfig::default().with_threads(0, 1);
        assert!(matches!(
            count_close_pairs(b"1.0 1.0 1.0\n", &config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
