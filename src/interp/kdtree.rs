//! k-d tree over points of arbitrary (fixed) dimension.
//!
//! Built once from the training attributes, queried for the k nearest
//! neighbours under Euclidean distance. Results are ordered by
//! `(distance², index)`, so equidistant points resolve to the lower training
//! index and repeated builds answer identically.

use std::cmp::Ordering;

#[derive(Debug, Clone)]
struct KdNode {
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    split_dim: usize,
}

#[derive(Debug, Clone)]
pub struct KdTree {
    dim: usize,
    /// Row-major `n × dim` coordinates.
    coords: Vec<f64>,
    nodes: Vec<KdNode>,
    root: Option<usize>,
}

/// Candidate neighbour ordered by distance, then index.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist_sq: f64,
    idx: usize,
}

impl Candidate {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.idx.cmp(&other.idx))
    }
}

impl KdTree {
    /// Build a tree over `n` points of dimension `dim` stored row-major.
    pub fn build(coords: &[f64], dim: usize) -> Self {
        let n = if dim == 0 { 0 } else { coords.len() / dim };
        let mut indices: Vec<usize> = (0..n).collect();
        let mut nodes = Vec::with_capacity(n);
        let mut tree = Self {
            dim,
            coords: coords.to_vec(),
            nodes: Vec::new(),
            root: None,
        };
        let root = tree.build_recursive(&mut indices, 0, &mut nodes);
        tree.nodes = nodes;
        tree.root = root;
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    fn point(&self, idx: usize) -> &[f64] {
        &self.coords[idx * self.dim..(idx + 1) * self.dim]
    }

    fn build_recursive(
        &self,
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }
        let split_dim = depth % self.dim;

        // Index as secondary key keeps the layout independent of sort stability.
        indices.sort_by(|&a, &b| {
            self.point(a)[split_dim]
                .total_cmp(&self.point(b)[split_dim])
                .then(a.cmp(&b))
        });

        let median = indices.len() / 2;
        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx: indices[median],
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let right_indices = &mut right_part[1..];
        let left = self.build_recursive(left_indices, depth + 1, nodes);
        let right = self.build_recursive(right_indices, depth + 1, nodes);
        nodes[node_idx].left = left;
        nodes[node_idx].right = right;
        Some(node_idx)
    }

    /// The `k` nearest points to `query` as `(index, distance²)`, nearest
    /// first.
    pub fn k_nearest(&self, query: &[f64], k: usize) -> Vec<(usize, f64)> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let mut best: Vec<Candidate> = Vec::with_capacity(k + 1);
        self.k_nearest_recursive(root, query, k, &mut best);
        best.into_iter().map(|c| (c.idx, c.dist_sq)).collect()
    }

    fn k_nearest_recursive(
        &self,
        node_idx: usize,
        query: &[f64],
        k: usize,
        best: &mut Vec<Candidate>,
    ) {
        let node = &self.nodes[node_idx];
        let point = self.point(node.point_idx);
        let dist_sq: f64 = point
            .iter()
            .zip(query)
            .map(|(p, q)| (p - q) * (p - q))
            .sum();
        insert_bounded(
            best,
            Candidate {
                dist_sq,
                idx: node.point_idx,
            },
            k,
        );

        let diff = query[node.split_dim] - point[node.split_dim];
        let (first, second) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(first_idx) = first {
            self.k_nearest_recursive(first_idx, query, k, best);
        }
        // `<=` so an equidistant point with a lower index is still reachable.
        if let Some(second_idx) = second {
            let worst = best.last().map_or(f64::INFINITY, |c| c.dist_sq);
            if best.len() < k || diff * diff <= worst {
                self.k_nearest_recursive(second_idx, query, k, best);
            }
        }
    }
}

/// Insert into a sorted list capped at `k` entries.
fn insert_bounded(best: &mut Vec<Candidate>, c: Candidate, k: usize) {
    let pos = best
        .binary_search_by(|entry| entry.cmp_key(&c))
        .unwrap_or_else(|p| p);
    if pos >= k {
        return;
    }
    best.insert(pos, c);
    best.truncate(k);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(coords: &[f64], dim: usize, q: &[f64], k: usize) -> Vec<usize> {
        let n = coords.len() / dim;
        let mut d: Vec<(f64, usize)> = (0..n)
            .map(|i| {
                let s: f64 = coords[i * dim..(i + 1) * dim]
                    .iter()
                    .zip(q)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                (s, i)
            })
            .collect();
        d.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        d.into_iter().take(k).map(|(_, i)| i).collect()
    }

    #[test]
    fn test_matches_brute_force_3d() {
        // Deterministic pseudo-random cloud
        let mut state = 12345u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 11) as f64) / ((1u64 << 53) as f64)
        };
        let coords: Vec<f64> = (0..3 * 200).map(|_| next()).collect();
        let tree = KdTree::build(&coords, 3);
        assert_eq!(tree.len(), 200);
        for _ in 0..25 {
            let q = [next(), next(), next()];
            let got: Vec<usize> = tree.k_nearest(&q, 7).into_iter().map(|(i, _)| i).collect();
            assert_eq!(got, brute_force(&coords, 3, &q, 7));
        }
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        // Four points on the unit circle around the origin plus duplicates.
        let coords = [1.0, 0.0, 0.0, 1.0, -1.0, 0.0, 0.0, -1.0, 1.0, 0.0];
        let tree = KdTree::build(&coords, 2);
        let got = tree.k_nearest(&[0.0, 0.0], 2);
        assert_eq!(got[0].0, 0);
        assert_eq!(got[1].0, 1);

        let dup = tree.k_nearest(&[1.0, 0.0], 2);
        assert_eq!(dup[0], (0, 0.0));
        assert_eq!(dup[1], (4, 0.0));
    }

    #[test]
    fn test_k_larger_than_n() {
        let tree = KdTree::build(&[0.0, 1.0, 2.0], 1);
        let got = tree.k_nearest(&[1.6], 10);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, 2);
    }

    #[test]
    fn test_empty() {
        let tree = KdTree::build(&[], 2);
        assert!(tree.is_empty());
        assert!(tree.k_nearest(&[0.0, 0.0], 3).is_empty());
    }
}
