//! Two-dimensional k-d tree over vehicle positions.
//!
//! Nodes live in an arena (`Vec<Node>`) and link to each other by index. Even
//! depths split on latitude, odd depths on longitude. Equal coordinates go to
//! the right, so a left subtree is always strictly less than its parent on the
//! parent's axis.
//!
//! The tree is never rebalanced. A hostile insertion order degrades it to a
//! list, which is accepted: vehicles arrive in effectively random order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::distance::haversine_meters;

const DIMENSIONS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: String,
    point: [f64; 2],
    left: Option<usize>,
    right: Option<usize>,
}

/// A vehicle returned by [`SpatialIndex::nearest`].
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance_meters: f64,
}

/// Mutable nearest-neighbour index keyed by vehicle id.
///
/// Not synchronised: a single partition worker owns each instance.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SpatialIndex {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: Option<usize>,
    /// Last known point of every indexed id.
    points: HashMap<String, [f64; 2]>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Inserts `id` at `point`, replacing any previous position of `id`.
    /// Non-finite points are refused and leave the index unchanged.
    pub fn insert(&mut self, id: &str, point: [f64; 2]) -> bool {
        if !point.iter().all(|c| c.is_finite()) {
            return false;
        }
        if self.points.contains_key(id) {
            self.delete(id);
        }

        let slot = self.alloc(Node {
            id: id.to_string(),
            point,
            left: None,
            right: None,
        });

        match self.root {
            None => self.root = Some(slot),
            Some(mut current) => {
                let mut depth = 0;
                loop {
                    let axis = depth % DIMENSIONS;
                    let node = &self.nodes[current];
                    let go_left = point[axis] < node.point[axis];
                    let next = if go_left { node.left } else { node.right };
                    match next {
                        Some(child) => {
                            current = child;
                            depth += 1;
                        }
                        None => {
                            let node = &mut self.nodes[current];
                            if go_left {
                                node.left = Some(slot);
                            } else {
                                node.right = Some(slot);
                            }
                            break;
                        }
                    }
                }
            }
        }

        self.points.insert(id.to_string(), point);
        true
    }

    /// Removes `id`. Returns false if it was not indexed.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(point) = self.points.remove(id) else {
            return false;
        };
        self.root = self.delete_rec(self.root, id, point, 0);
        true
    }

    /// Up to `k` ids ordered by ascending distance from `point`.
    ///
    /// Every node is visited: the far branch is searched even when it cannot
    /// hold a closer candidate.
    pub fn nearest(&self, point: [f64; 2], k: usize) -> Vec<Neighbor> {
        let mut best = CandidateList::new(k);
        if k > 0 {
            self.search(self.root, point, 0, &mut best);
        }
        best.entries
            .into_iter()
            .map(|(distance_meters, idx)| Neighbor {
                id: self.nodes[idx].id.clone(),
                distance_meters,
            })
            .collect()
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn delete_rec(
        &mut self,
        link: Option<usize>,
        id: &str,
        point: [f64; 2],
        depth: usize,
    ) -> Option<usize> {
        let idx = link?;
        let axis = depth % DIMENSIONS;

        if self.nodes[idx].id == id && self.nodes[idx].point == point {
            if let Some(right) = self.nodes[idx].right {
                let (min_id, min_point) = self.take_min(idx, right, axis, depth);
                self.nodes[idx].right = self.delete_rec(Some(right), &min_id, min_point, depth + 1);
            } else if let Some(left) = self.nodes[idx].left {
                // Promote the left minimum and hang the rest of the left
                // subtree on the right.
                let (min_id, min_point) = self.take_min(idx, left, axis, depth);
                self.nodes[idx].right = self.delete_rec(Some(left), &min_id, min_point, depth + 1);
                self.nodes[idx].left = None;
            } else {
                self.free.push(idx);
                return None;
            }
            return Some(idx);
        }

        if point[axis] < self.nodes[idx].point[axis] {
            let left = self.nodes[idx].left;
            self.nodes[idx].left = self.delete_rec(left, id, point, depth + 1);
        } else {
            let right = self.nodes[idx].right;
            self.nodes[idx].right = self.delete_rec(right, id, point, depth + 1);
        }
        Some(idx)
    }

    /// Copies the minimum of `subtree` on `axis` into `target`, returning what was copied.
    fn take_min(
        &mut self,
        target: usize,
        subtree: usize,
        axis: usize,
        depth: usize,
    ) -> (String, [f64; 2]) {
        let min = self.find_min(subtree, axis, depth + 1);
        let min_id = self.nodes[min].id.clone();
        let min_point = self.nodes[min].point;
        self.nodes[target].id = min_id.clone();
        self.nodes[target].point = min_point;
        (min_id, min_point)
    }

    fn find_min(&self, idx: usize, axis: usize, depth: usize) -> usize {
        let node = &self.nodes[idx];
        if depth % DIMENSIONS == axis {
            return match node.left {
                Some(left) => self.find_min(left, axis, depth + 1),
                None => idx,
            };
        }

        let mut min = idx;
        for child in [node.left, node.right].into_iter().flatten() {
            let candidate = self.find_min(child, axis, depth + 1);
            if self.nodes[candidate].point[axis] < self.nodes[min].point[axis] {
                min = candidate;
            }
        }
        min
    }

    fn search(&self, link: Option<usize>, target: [f64; 2], depth: usize, best: &mut CandidateList) {
        let Some(idx) = link else {
            return;
        };
        let node = &self.nodes[idx];
        let axis = depth % DIMENSIONS;
        let (near, far) = if target[axis] < node.point[axis] {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        self.search(near, target, depth + 1, best);
        best.offer(haversine_meters(target, node.point), idx);
        self.search(far, target, depth + 1, best);
    }
}

/// Bounded list of arena slots sorted by ascending distance.
struct CandidateList {
    capacity: usize,
    entries: Vec<(f64, usize)>,
}

impl CandidateList {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity.min(64)),
        }
    }

    fn offer(&mut self, distance: f64, idx: usize) {
        if let Some(pos) = self.entries.iter().position(|(d, _)| distance < *d) {
            self.entries.insert(pos, (distance, idx));
            self.entries.truncate(self.capacity);
        } else if self.entries.len() < self.capacity {
            self.entries.push((distance, idx));
        }
    }
}
