//! Dense grid index: one linked list of point indices per cell.
//!
//! Simpler ancestor of the chunked table. The whole key space is allocated up
//! front and filled by a single thread, so no atomics are needed; counting is
//! parallel over x-slabs assigned with a fixed stride (`t, t + T, ...`).

use std::thread;
use std::time::Instant;

use tracing::{debug, info_span, trace};

use crate::cell::{CELLS_PER_AXIS, HALF_STENCIL, KEY_SPACE, Point, key_of, neighbour};

const NIL: u32 = u32::MAX;

pub struct Grid {
    points: Vec<Point>,
    /// Most recently inserted point of every cell, or `NIL`.
    heads: Vec<u32>,
    /// Next older point of the same cell, or `NIL`.
    next: Vec<u32>,
}

impl Grid {
    /// Bucket `points` into the grid.
    ///
    /// # Panics
    /// If there are `u32::MAX` points or more.
    pub fn build(points: Vec<Point>) -> Self {
        assert!(points.len() < NIL as usize, "too many points for a grid index");
        let _span = info_span!("grid_build", points = points.len()).entered();
        let mut heads = vec![NIL; KEY_SPACE as usize];
        let mut next = vec![NIL; points.len()];
        for (i, p) in points.iter().enumerate() {
            let head = &mut heads[p.key() as usize];
            next[i] = *head;
            *head = i as u32;
        }
        Self { points, heads, next }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points of the cell `key`, newest first.
    pub fn cell(&self, key: u64) -> Cell<'_> {
        Cell {
            grid: self,
            cur: self.heads[key as usize],
        }
    }

    fn close_to(&self, a: &Point, key: u64) -> u64 {
        self.cell(key).filter(|b| a.is_close(b)).count() as u64
    }

    /// Pairs found from the cells in x-slab `bx`.
    fn count_slab(&self, bx: u64) -> u64 {
        let mut pairs = 0;
        for by in 1..CELLS_PER_AXIS - 1 {
            for bz in 1..CELLS_PER_AXIS - 1 {
                let key = key_of(bx, by, bz);
                let mut cur = self.heads[key as usize];
                while cur != NIL {
                    let a = &self.points[cur as usize];
                    cur = self.next[cur as usize];
                    // The rest of this cell's list.
                    pairs += Cell { grid: self, cur }.filter(|b| a.is_close(b)).count() as u64;
                    for &delta in &HALF_STENCIL {
                        pairs += self.close_to(a, neighbour(key, delta));
                    }
                }
            }
        }
        pairs
    }

    /// Count close pairs with `threads` counter threads.
    pub fn count_pairs(&self, threads: usize) -> u64 {
        let _span = info_span!("count", threads, index = "grid").entered();
        let started = Instant::now();
        let threads = threads.max(1);
        let pairs: u64 = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    s.spawn(move || {
                        let mut local: u64 = 0;
                        // Halo slabs 0 and N-1 are never populated.
                        let mut bx = 1 + t as u64;
                        while bx < CELLS_PER_AXIS - 1 {
                            local += self.count_slab(bx);
                            bx += threads as u64;
                        }
                        trace!(thread = t, pairs = local, "counter done");
                        local
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
                .sum()
        });
        debug!(pairs, elapsed_us = started.elapsed().as_micros() as u64, "count complete");
        pairs
    }
}

/// Iterator over the points of one grid cell.
pub struct Cell<'a> {
    grid: &'a Grid,
    cur: u32,
}

impl<'a> Iterator for Cell<'a> {
    type Item = &'a Point;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let i = self.cur as usize;
        self.cur = self.grid.next[i];
        Some(&self.grid.points[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::count::brute_force;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn cloud(n: usize, half_width: f32, seed: u64) -> Vec<Point> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let [x, y, z]: [f32; 3] =
                    std::array::from_fn(|_| rng.random_range(-half_width..half_width));
                Point::new(x, y, z)
            })
            .collect()
    }

    #[test]
    fn cells_hold_their_points_newest_first() {
        let a = Point::new(1.01, 1.01, 1.01);
        let b = Point::new(1.02, 1.02, 1.02);
        let c = Point::new(-5.0, 2.0, 7.5);
        let grid = Grid::build(vec![a, b, c]);
        assert_eq!(grid.len(), 3);
        let cell: Vec<Point> = grid.cell(a.key()).copied().collect();
        assert_eq!(cell, vec![b, a]);
        assert_eq!(grid.cell(c.key()).count(), 1);
        assert_eq!(grid.cell(Point::new(0.0, 0.0, 0.0).key()).count(), 0);
    }

    #[test]
    fn empty_grid() {
        let grid = Grid::build(Vec::new());
        assert!(grid.is_empty());
        assert_eq!(grid.count_pairs(3), 0);
    }

    #[test]
    fn matches_brute_force() {
        for seed in 0..5 {
            for half_width in [0.4, 9.999] {
                let points = cloud(500, half_width, seed);
                let expected = brute_force(&points);
                let grid = Grid::build(points);
                assert_eq!(grid.count_pairs(4), expected, "seed={seed}");
            }
        }
    }

    #[test]
    fn thread_count_does_not_change_the_result() {
        let grid = Grid::build(cloud(3_000, 1.0, 17));
        let single = grid.count_pairs(1);
        assert!(single > 0);
        for threads in [2, 8, 33, 250] {
            assert_eq!(grid.count_pairs(threads), single, "threads={threads}");
        }
    }
}
