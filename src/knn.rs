//! Nearest-neighbour restriction of the candidate pairs.
//!
//! Every spike is described by a feature vector (amplitude, x, y), standardized over all spikes.
//! A unit stays a candidate partner of another unit only if some spikes of the latter are among the
//! nearest neighbours of the spikes of the former in feature space.
//!
//! Two exact search strategies implement [`NeighborSearch`]: an exhaustive scan, and a k-d tree
//! for large recordings. They return the same neighbours, ties being broken by point index.
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::candidates::CandidateMatrix;
use crate::error::MergeError;
use crate::MIN_PAIRS_PAR;

/// A spike feature vector: amplitude, x and y.
pub type Feature = [f64; 3];

/// An exact k-nearest-neighbour search over a fixed set of points.
pub trait NeighborSearch: Sync {
    /// Returns the indices of the (at most) `k` points closest to the query, nearest first.
    /// Equidistant points are ordered by index.
    fn k_nearest(&self, query: &Feature, k: usize) -> Vec<usize>;
}

/// The search strategy used by the nearest-neighbour stage.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborAlgorithm {
    BruteForce,
    KdTree,
}

impl NeighborAlgorithm {
    pub fn from_str(s: &str) -> Result<Self, MergeError> {
        match s {
            "bruteforce" => Ok(NeighborAlgorithm::BruteForce),
            "kdtree" => Ok(NeighborAlgorithm::KdTree),
            _ => Err(MergeError::InvalidParameter(format!(
                "Invalid neighbour search {}: must be one of bruteforce, kdtree",
                s
            ))),
        }
    }

    /// Index the points with this strategy.
    pub fn build(&self, points: Vec<Feature>) -> Box<dyn NeighborSearch> {
        match self {
            NeighborAlgorithm::BruteForce => Box::new(BruteForceSearch::new(points)),
            NeighborAlgorithm::KdTree => Box::new(KdTree::build(points)),
        }
    }
}

fn distance_squared(a: &Feature, b: &Feature) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Keeps the k smallest (distance, index) entries seen so far.
struct BoundedHeap {
    capacity: usize,
    heap: BinaryHeap<(OrderedFloat<f64>, usize)>,
}

impl BoundedHeap {
    fn new(capacity: usize) -> Self {
        BoundedHeap {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    fn push(&mut self, dist_sq: f64, index: usize) {
        let entry = (OrderedFloat(dist_sq), index);
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry.cmp(worst) == Ordering::Less {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    fn max_distance(&self) -> f64 {
        self.heap.peek().map_or(f64::INFINITY, |(d, _)| d.0)
    }

    fn into_sorted_indices(self) -> Vec<usize> {
        self.heap.into_sorted_vec().into_iter().map(|(_, index)| index).collect()
    }
}

/// Exhaustive search, linear in the number of points per query.
#[derive(Debug, Clone)]
pub struct BruteForceSearch {
    points: Vec<Feature>,
}

impl BruteForceSearch {
    pub fn new(points: Vec<Feature>) -> Self {
        BruteForceSearch { points }
    }
}

impl NeighborSearch for BruteForceSearch {
    fn k_nearest(&self, query: &Feature, k: usize) -> Vec<usize> {
        if k == 0 {
            return vec![];
        }
        let mut heap = BoundedHeap::new(k);
        for (index, point) in self.points.iter().enumerate() {
            heap.push(distance_squared(query, point), index);
        }
        heap.into_sorted_indices()
    }
}

#[derive(Debug, Clone)]
struct KdNode {
    point_idx: usize,
    split_dim: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// A k-d tree over the feature space, built by median splits.
#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    points: Vec<Feature>,
}

impl KdTree {
    pub fn build(points: Vec<Feature>) -> Self {
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        Self::build_recursive(&points, &mut indices, 0, &mut nodes);
        KdTree { nodes, points }
    }

    fn build_recursive(
        points: &[Feature],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = depth % 3;
        indices.sort_by(|&a, &b| points[a][split_dim].total_cmp(&points[b][split_dim]));

        let median = indices.len() / 2;
        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx: indices[median],
            split_dim,
            left: None,
            right: None,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, &mut right_part[1..], depth + 1, nodes);
        nodes[node_idx].left = left;
        nodes[node_idx].right = right;

        Some(node_idx)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn k_nearest_recursive(&self, node_idx: usize, query: &Feature, heap: &mut BoundedHeap) {
        let node = &self.nodes[node_idx];
        let point = &self.points[node.point_idx];
        heap.push(distance_squared(query, point), node.point_idx);

        let diff = query[node.split_dim] - point[node.split_dim];
        let (first, second) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(first_idx) = first {
            self.k_nearest_recursive(first_idx, query, heap);
        }
        // Equal distances must be visited too, for ties to be broken by index
        if let Some(second_idx) = second {
            if !heap.is_full() || diff * diff <= heap.max_distance() {
                self.k_nearest_recursive(second_idx, query, heap);
            }
        }
    }
}

impl NeighborSearch for KdTree {
    fn k_nearest(&self, query: &Feature, k: usize) -> Vec<usize> {
        if k == 0 || self.nodes.is_empty() {
            return vec![];
        }
        let mut heap = BoundedHeap::new(k);
        self.k_nearest_recursive(0, query, &mut heap);
        heap.into_sorted_indices()
    }
}

/// Standardize every feature dimension to zero mean and unit variance.
/// Constant dimensions are only centered.
pub fn standardize(features: &[Feature]) -> Vec<Feature> {
    if features.is_empty() {
        return vec![];
    }
    let n = features.len() as f64;
    let mut mean = [0.0; 3];
    let mut std = [0.0; 3];
    for d in 0..3 {
        mean[d] = features.iter().map(|f| f[d]).sum::<f64>() / n;
        std[d] = (features.iter().map(|f| (f[d] - mean[d]).powi(2)).sum::<f64>() / n).sqrt();
        if std[d] == 0.0 {
            std[d] = 1.0;
        }
    }
    features
        .iter()
        .map(|f| [
            (f[0] - mean[0]) / std[0],
            (f[1] - mean[1]) / std[1],
            (f[2] - mean[2]) / std[2],
        ])
        .collect()
}

/// For every unit, returns the other units owning at least one of the `k` nearest neighbours of one
/// of its spikes.
pub fn neighbor_units(
    unit_features: &[&[Feature]],
    k: usize,
    algorithm: NeighborAlgorithm,
) -> Vec<BTreeSet<usize>> {
    let spike_units: Vec<usize> = unit_features
        .iter()
        .enumerate()
        .flat_map(|(unit, features)| std::iter::repeat(unit).take(features.len()))
        .collect();
    let all_features: Vec<Feature> = unit_features.iter().flat_map(|f| f.iter().copied()).collect();
    let standardized = standardize(&all_features);
    let search = algorithm.build(standardized.clone());

    let mut offset = 0;
    let mut neighbors = Vec::with_capacity(unit_features.len());
    for (unit, features) in unit_features.iter().enumerate() {
        let queries = &standardized[offset..offset + features.len()];
        offset += features.len();

        let find = |query: &Feature| search.k_nearest(query, k);
        let found: Vec<Vec<usize>> = if queries.len() >= MIN_PAIRS_PAR {
            queries.par_iter().map(find).collect()
        } else {
            queries.iter().map(find).collect()
        };

        let units: BTreeSet<usize> = found
            .into_iter()
            .flatten()
            .map(|spike| spike_units[spike])
            .filter(|&other| other != unit)
            .collect();
        neighbors.push(units);
    }

    log::debug!(
        "Nearest neighbours found for {} spikes of {} units",
        all_features.len(),
        unit_features.len()
    );
    neighbors
}

/// Keep only the candidate pairs `(i, j)` where `j` is a neighbour unit of `i`.
pub fn restrict_to_neighbors(candidates: &mut CandidateMatrix, neighbors: &[BTreeSet<usize>]) {
    candidates.retain(|i, j| neighbors.get(i).is_some_and(|units| units.contains(&j)));
}
