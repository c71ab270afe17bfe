//! Unbalanced 3-d tree, the single-threaded baseline index.
//!
//! Points are inserted one by one without sorting, cycling the split axis with
//! depth, so the shape depends on input order. Nodes live in one arena and
//! link by index; traversals use an explicit stack because degenerate
//! (sorted) inputs make the tree as deep as it is long.

use std::time::Instant;

use tracing::{debug, info_span};

use crate::cell::{Point, THRESHOLD_SQ};

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    point: Point,
    /// Points with a smaller coordinate on this node's axis.
    left: u32,
    /// Points with an equal or larger coordinate.
    right: u32,
}

#[derive(Debug, Default)]
pub struct KdTree {
    nodes: Vec<Node>,
}

impl KdTree {
    /// Build a tree by inserting `points` last to first.
    pub fn build(points: &[Point]) -> Self {
        let _span = info_span!("kd_build", points = points.len()).entered();
        let mut tree = Self {
            nodes: Vec::with_capacity(points.len()),
        };
        for p in points.iter().rev() {
            tree.insert(*p);
        }
        tree
    }

    /// Insert `point` below the existing nodes.
    ///
    /// # Panics
    /// If the tree already holds `u32::MAX` nodes.
    pub fn insert(&mut self, point: Point) {
        assert!(self.nodes.len() < NIL as usize, "k-d tree is full");
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            point,
            left: NIL,
            right: NIL,
        });
        if id == 0 {
            return;
        }

        let mut cur = 0;
        let mut axis = 0;
        loop {
            let node = &mut self.nodes[cur as usize];
            let child = if point.0[axis] < node.point.0[axis] {
                &mut node.left
            } else {
                &mut node.right
            };
            if *child == NIL {
                *child = id;
                return;
            }
            cur = *child;
            axis = (axis + 1) % 3;
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn max_depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut deepest = 0;
        let mut stack = vec![(0u32, 1usize)];
        while let Some((id, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            let node = &self.nodes[id as usize];
            for child in [node.left, node.right] {
                if child != NIL {
                    stack.push((child, depth + 1));
                }
            }
        }
        deepest
    }

    /// Number of stored points within the threshold of `point`, `point`
    /// itself included if it is stored.
    pub fn count_within(&self, point: &Point) -> u64 {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut count = 0;
        let mut stack = vec![(0u32, 0usize)];
        while let Some((id, axis)) = stack.pop() {
            let node = &self.nodes[id as usize];
            if point.is_close(&node.point) {
                count += 1;
            }
            let d = point.0[axis] - node.point.0[axis];
            let next_axis = (axis + 1) % 3;
            let (near, far) = if d <= 0.0 {
                (node.left, node.right)
            } else {
                (node.right, node.left)
            };
            if near != NIL {
                stack.push((near, next_axis));
            }
            // The far side can only hold close points if the split plane is
            // within range.
            if far != NIL && d * d <= THRESHOLD_SQ {
                stack.push((far, next_axis));
            }
        }
        count
    }

    /// Close pairs among the stored points.
    ///
    /// `count_within` sees every point itself once and every pair from both
    /// ends, hence `(sum - n) / 2`.
    pub fn count_pairs(&self) -> u64 {
        let _span = info_span!("count", index = "kd-tree", points = self.len()).entered();
        let started = Instant::now();
        let total: u64 = self.nodes.iter().map(|n| self.count_within(&n.point)).sum();
        let pairs = (total - self.len() as u64) / 2;
        debug!(pairs, elapsed_us = started.elapsed().as_micros() as u64, "count complete");
        pairs
    }
}
