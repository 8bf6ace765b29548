//! The candidate matrix, i.e., the set of unit pairs which are still eligible for merging.
//!
//! Only the strict upper triangle is meaningful: the pair `(i, j)` is stored with `i < j`.
//! Entries can be cleared but never set again, so the candidate set shrinks monotonically
//! through the pipeline.

use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::MIN_PAIRS_PAR;

/// A boolean N x N matrix of candidate pairs.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct CandidateMatrix {
    num_units: usize,
    mask: Vec<bool>,
}

impl CandidateMatrix {
    /// Create a candidate matrix where every pair of distinct units is a candidate.
    pub fn new(num_units: usize) -> Self {
        let mut mask = vec![false; num_units * num_units];
        for i in 0..num_units {
            for j in (i + 1)..num_units {
                mask[i * num_units + j] = true;
            }
        }
        CandidateMatrix { num_units, mask }
    }

    /// Returns the number of units.
    pub fn num_units(&self) -> usize {
        self.num_units
    }

    /// Returns whether the pair is a candidate. The order of the two indices does not matter.
    pub fn get(&self, i: usize, j: usize) -> bool {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        i != j && j < self.num_units && self.mask[i * self.num_units + j]
    }

    /// Remove a pair from the candidates.
    pub fn clear(&mut self, i: usize, j: usize) {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        if j < self.num_units {
            self.mask[i * self.num_units + j] = false;
        }
    }

    /// Remove every pair involving the unit, i.e., clear its row and column.
    pub fn clear_unit(&mut self, unit_index: usize) {
        if unit_index >= self.num_units {
            return;
        }
        for other in 0..self.num_units {
            self.clear(unit_index, other);
        }
    }

    /// Keep only the candidate pairs for which the predicate holds.
    pub fn retain<F: FnMut(usize, usize) -> bool>(&mut self, mut keep: F) {
        for (i, j) in self.pairs() {
            if !keep(i, j) {
                self.clear(i, j);
            }
        }
    }

    /// Keep only the candidate pairs whose score satisfies the predicate.
    /// Scores are read from the upper triangle of the matrix.
    pub fn retain_scores<F: Fn(f64) -> bool>(&mut self, scores: &DMatrix<f64>, keep: F) {
        self.retain(|i, j| keep(scores[(i, j)]));
    }

    /// Returns the number of candidate pairs.
    pub fn count(&self) -> usize {
        self.mask.iter().filter(|&&b| b).count()
    }

    /// Returns the candidate pairs `(i, j)`, with `i < j`, in row-major order.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        (0..self.num_units)
            .flat_map(|i| ((i + 1)..self.num_units).map(move |j| (i, j)))
            .filter(|&(i, j)| self.mask[i * self.num_units + j])
            .collect()
    }

    /// Evaluate a pairwise function on every candidate pair, in row-major order.
    /// The evaluation is parallelized over pairs for large candidate sets.
    pub fn evaluate_pairs<T, F>(&self, f: F) -> Vec<((usize, usize), T)>
    where
        T: Send,
        F: Fn(usize, usize) -> T + Sync + Send,
    {
        let pairs = self.pairs();
        let values: Vec<T> = if pairs.len() >= MIN_PAIRS_PAR {
            pairs.par_iter().map(|&(i, j)| f(i, j)).collect()
        } else {
            pairs.iter().map(|&(i, j)| f(i, j)).collect()
        };
        pairs.into_iter().zip(values).collect()
    }

    /// Evaluate a pairwise score for every candidate pair.
    /// Non-candidate entries are NaN. The matrix is only written once all scores are available.
    pub fn map_pairs<F>(&self, score: F) -> DMatrix<f64>
    where
        F: Fn(usize, usize) -> f64 + Sync + Send,
    {
        let mut scores = DMatrix::from_element(self.num_units, self.num_units, f64::NAN);
        for ((i, j), value) in self.evaluate_pairs(score) {
            scores[(i, j)] = value;
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_matrix_new() {
        let candidates = CandidateMatrix::new(4);
        assert_eq!(candidates.count(), 6);
        assert!(candidates.get(0, 1));
        assert!(candidates.get(1, 0));
        assert!(!candidates.get(2, 2));
        assert_eq!(
            candidates.pairs(),
            vec![(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]
        );
    }

    #[test]
    fn test_clear_unit() {
        let mut candidates = CandidateMatrix::new(4);
        candidates.clear_unit(1);
        assert_eq!(candidates.pairs(), vec![(0, 2), (0, 3), (2, 3)]);
        candidates.clear(3, 0);
        assert_eq!(candidates.pairs(), vec![(0, 2), (2, 3)]);
    }

    #[test]
    fn test_map_pairs_and_retain() {
        let mut candidates = CandidateMatrix::new(3);
        candidates.clear(0, 2);

        let scores = candidates.map_pairs(|i, j| (i + j) as f64);
        assert_eq!(scores[(0, 1)], 1.0);
        assert_eq!(scores[(1, 2)], 3.0);
        assert!(scores[(0, 2)].is_nan());
        assert!(scores[(1, 0)].is_nan());

        candidates.retain_scores(&scores, |score| score < 2.0);
        assert_eq!(candidates.pairs(), vec![(0, 1)]);
    }

    #[test]
    fn test_evaluate_pairs_in_parallel() {
        // Enough pairs to go through the parallel path
        let candidates = CandidateMatrix::new(20);
        assert!(candidates.count() >= MIN_PAIRS_PAR);
        let products = candidates.evaluate_pairs(|i, j| i * j);
        assert_eq!(products.len(), 190);
        assert_eq!(products[0], ((0, 1), 0));
        assert_eq!(products[189], ((18, 19), 342));
    }

    #[test]
    fn test_empty_matrix() {
        let candidates = CandidateMatrix::new(0);
        assert_eq!(candidates.count(), 0);
        assert!(candidates.pairs().is_empty());
        assert_eq!(candidates.map_pairs(|_, _| 0.0).len(), 0);
    }
}
