//! Points and the uniform cell grid they are bucketed into.
//!
//! Coordinates live in the open interval (-10, 10). Cells are cubes of side
//! [`CELL_SIZE`]; every axis gets one extra halo cell on each side so that
//! `key ± offset` for any of the 26 neighbours stays inside the key space
//! without bounds checks. Halo cells are never populated.

/// Side length of a cell.
pub const CELL_SIZE: f32 = 0.1;

/// Two points closer than or equal to this distance form a pair.
pub const THRESHOLD: f32 = 0.05;

/// Squared threshold, compared against squared distances computed in `f32`.
/// This is the float nearest 0.0025; `THRESHOLD * THRESHOLD` in `f32` rounds
/// one ULP above it.
pub const THRESHOLD_SQ: f32 = 0.0025;

/// Lower bound of the coordinate range.
pub const COORD_MIN: f32 = -10.0;

/// Cells per axis: the span of the range plus one, plus a halo cell each side.
pub const CELLS_PER_AXIS: u64 = (20.0 / CELL_SIZE) as u64 + 1 + 2;

/// Total number of distinct keys, halo cells included.
pub const KEY_SPACE: u64 = CELLS_PER_AXIS * CELLS_PER_AXIS * CELLS_PER_AXIS;

// The neighbour search only looks one cell away.
const _: () = assert!(THRESHOLD < CELL_SIZE);

/// A point padded to four lanes so the squared distance is a 4-wide dot
/// product. The fourth lane is always zero.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(C, align(16))]
pub struct Point(pub [f32; 4]);

impl Point {
    #[inline(always)]
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self([x, y, z, 0.0])
    }

    #[inline(always)]
    pub fn x(&self) -> f32 {
        self.0[0]
    }

    #[inline(always)]
    pub fn y(&self) -> f32 {
        self.0[1]
    }

    #[inline(always)]
    pub fn z(&self) -> f32 {
        self.0[2]
    }

    /// Squared Euclidean distance. The lane order is fixed, and `a - b` and
    /// `b - a` square to the same value, so the result does not depend on
    /// which of the two points is `self`.
    #[inline(always)]
    pub fn dist2(&self, other: &Point) -> f32 {
        let mut d = [0.0f32; 4];
        for lane in 0..4 {
            d[lane] = self.0[lane] - other.0[lane];
        }
        (d[0] * d[0] + d[1] * d[1]) + (d[2] * d[2] + d[3] * d[3])
    }

    /// Inclusive threshold test used by every counter in the crate.
    #[inline(always)]
    pub fn is_close(&self, other: &Point) -> bool {
        self.dist2(other) <= THRESHOLD_SQ
    }

    /// Cell coordinates of this point, halo offset included.
    #[inline(always)]
    pub fn bucket(&self) -> [u64; 3] {
        [axis_bucket(self.0[0]), axis_bucket(self.0[1]), axis_bucket(self.0[2])]
    }

    /// Cell identifier of this point.
    #[inline(always)]
    pub fn key(&self) -> u64 {
        let [bx, by, bz] = self.bucket();
        key_of(bx, by, bz)
    }
}

#[inline(always)]
fn axis_bucket(coord: f32) -> u64 {
    // `(c + 10) / size` is non-negative for c > -10, so truncation is floor.
    ((coord - COORD_MIN) / CELL_SIZE) as u64 + 1
}

/// Combine per-axis cell coordinates into a key.
#[inline(always)]
pub const fn key_of(bx: u64, by: u64, bz: u64) -> u64 {
    bx * CELLS_PER_AXIS * CELLS_PER_AXIS + by * CELLS_PER_AXIS + bz
}

/// Inverse of [`key_of`].
#[inline(always)]
pub const fn bucket_of(key: u64) -> [u64; 3] {
    let n = CELLS_PER_AXIS;
    [key / (n * n), (key / n) % n, key % n]
}

const fn offset(dx: i64, dy: i64, dz: i64) -> i64 {
    let n = CELLS_PER_AXIS as i64;
    dx * n * n + dy * n + dz
}

/// Key deltas of the forward half of the 3x3x3 stencil. For every pair of
/// adjacent cells exactly one of the two reaches the other through this set;
/// pairs inside a cell are handled separately.
pub const HALF_STENCIL: [i64; 13] = [
    offset(1, 0, 0),
    offset(1, 1, 0),
    offset(1, 1, 1),
    offset(1, 1, -1),
    offset(1, -1, 0),
    offset(1, -1, 1),
    offset(1, -1, -1),
    offset(1, 0, -1),
    offset(1, 0, 1),
    offset(0, 1, 0),
    offset(0, 1, 1),
    offset(0, 1, -1),
    offset(0, 0, 1),
];

/// Key of the neighbour of `key` at `delta`. Never leaves the key space for
/// populated cells thanks to the halo.
#[inline(always)]
pub fn neighbour(key: u64, delta: i64) -> u64 {
    key.wrapping_add_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    #[test]
    fn grid_dimensions() {
        assert_eq!(CELLS_PER_AXIS, 203);
        assert_eq!(KEY_SPACE, 203 * 203 * 203);
    }

    #[test]
    fn same_cell_same_key() {
        let a = Point::new(0.01, 0.02, 0.03);
        let b = Point::new(0.09, 0.05, 0.001);
        assert_eq!(a.bucket(), b.bucket());
        assert_eq!(a.key(), b.key());

        let c = Point::new(0.11, 0.02, 0.03);
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn key_round_trips_through_bucket() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..10_000 {
            let p = Point::new(
                rng.random_range(-9.999..9.999),
                rng.random_range(-9.999..9.999),
                rng.random_range(-9.999..9.999),
            );
            assert_eq!(bucket_of(p.key()), p.bucket());
        }
    }

    #[test]
    fn extremes_stay_inside_halo() {
        for c in [-9.999_999f32, 9.999_999] {
            let [bx, by, bz] = Point::new(c, c, c).bucket();
            for b in [bx, by, bz] {
                assert!(b >= 1 && b + 1 < CELLS_PER_AXIS, "bucket {b} for {c}");
            }
        }
    }

    #[test]
    fn distinct_buckets_distinct_keys() {
        let mut seen = HashSet::new();
        for bx in 0..CELLS_PER_AXIS {
            for by in [0, 1, 101, CELLS_PER_AXIS - 1] {
                for bz in [0, 57, CELLS_PER_AXIS - 1] {
                    assert!(seen.insert(key_of(bx, by, bz)));
                }
            }
        }
    }

    #[test]
    fn half_stencil_covers_each_neighbour_pair_once() {
        let mut forward: HashSet<i64> = HashSet::new();
        for &d in &HALF_STENCIL {
            assert_ne!(d, 0);
            assert!(forward.insert(d), "duplicate offset {d}");
            assert!(!forward.contains(&-d), "offset {d} and its inverse");
        }
        let mut all = HashSet::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if (dx, dy, dz) != (0, 0, 0) {
                        all.insert(offset(dx, dy, dz));
                    }
                }
            }
        }
        let covered: HashSet<i64> = forward.iter().flat_map(|&d| [d, -d]).collect();
        assert_eq!(covered, all);
    }

    #[test]
    fn neighbour_moves_one_cell() {
        let key = key_of(10, 20, 30);
        assert_eq!(neighbour(key, offset(1, -1, 1)), key_of(11, 19, 31));
        assert_eq!(neighbour(key, offset(0, 0, 1)), key_of(10, 20, 31));
    }

    #[test]
    fn dist2_ignores_padding_and_is_symmetric() {
        let a = Point::new(1.0, 2.0, 3.0);
        let b = Point::new(1.5, 1.0, 3.25);
        assert_eq!(a.dist2(&b), 0.25 + 1.0 + 0.0625);
        assert_eq!(a.dist2(&b).to_bits(), b.dist2(&a).to_bits());
        assert_eq!(a.dist2(&a), 0.0);
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(THRESHOLD_SQ.to_bits(), 0x3B23_D70A);
        let origin = Point::new(0.0, 0.0, 0.0);

        // 0.03² + 0.04² rounds to exactly THRESHOLD_SQ.
        let on = Point::new(0.03, -0.04, 0.0);
        assert_eq!(origin.dist2(&on).to_bits(), THRESHOLD_SQ.to_bits());
        assert!(origin.is_close(&on));

        // 0.05f32 is slightly above 0.05; its square is the next float up.
        let past = Point::new(THRESHOLD, 0.0, 0.0);
        assert_eq!(origin.dist2(&past).to_bits(), 0x3B23_D70B);
        assert!(!origin.is_close(&past));
        assert!(!origin.is_close(&Point::new(0.0, 0.0, -THRESHOLD)));
    }
}
