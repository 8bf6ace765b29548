//! Quality score of units and validation of candidate merges.
//!
//! The quality score of a unit balances its firing rate against its contamination,
//! `f * (1 - (k + 1) * c)`. A candidate merge is validated only if the merged unit scores at least as
//! well as each of the two original units. Merges are simulated on copies of the spike trains: the
//! analyzer is never modified.
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analyzer::Analyzer;
use crate::candidates::CandidateMatrix;
use crate::contamination::{refractory_contamination, RefractoryWindow};
use crate::spike_train::SpikeTrain;
use crate::MIN_PAIRS_PAR;

/// Returns the quality score of a unit.
pub fn quality_score(firing_rate: f64, contamination: f64, firing_contamination_balance: f64) -> f64 {
    firing_rate * (1.0 - (firing_contamination_balance + 1.0) * contamination)
}

/// The statistics of a hypothetical merged unit.
#[derive(Debug, PartialEq, Clone)]
pub struct MergeSimulation {
    pub spike_train: SpikeTrain,
    pub contamination: f64,
    pub firing_rate: f64,
}

/// Merge two spike trains, dropping spikes within the censored period of each other, and recompute the
/// contamination and firing rate of the result.
pub fn simulate_merge(
    spike_train_1: &SpikeTrain,
    spike_train_2: &SpikeTrain,
    sampling_frequency: f64,
    num_samples: u64,
    window: &RefractoryWindow,
) -> MergeSimulation {
    let (delta, _) = window.to_samples(sampling_frequency);
    let spike_train = spike_train_1.merge_with(spike_train_2, delta);
    let contamination = refractory_contamination(&spike_train, sampling_frequency, num_samples, window);
    let firing_rate = spike_train.firing_rate(sampling_frequency, num_samples);
    MergeSimulation {
        spike_train,
        contamination,
        firing_rate,
    }
}

/// The outcome of the validation of the candidate merges.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Validation {
    /// The pairs whose merge would decrease the quality score.
    pub pairs_decreased_score: Vec<(usize, usize)>,
    /// The pairs left out because of the bound on the number of simulated merges.
    pub pairs_not_validated: Vec<(usize, usize)>,
}

/// Simulate the merge of every candidate pair and clear the pairs whose merged unit scores lower than
/// either of the original units. A merged score which is not a number counts as lower.
///
/// If `max_validated_pairs` is set, only that many pairs are simulated (in row-major order) and the
/// remaining pairs are cleared as well. Returns the outcome and the merged scores (NaN for pairs which
/// were not simulated).
pub fn check_improve_contaminations_score<A: Analyzer + ?Sized>(
    analyzer: &A,
    candidates: &mut CandidateMatrix,
    contaminations: &[f64],
    firing_contamination_balance: f64,
    window: &RefractoryWindow,
    max_validated_pairs: Option<usize>,
) -> (Validation, DMatrix<f64>) {
    let sampling_frequency = analyzer.sampling_frequency();
    let num_samples = analyzer.num_samples();
    let firing_rates = analyzer.firing_rates();

    let mut pairs = candidates.pairs();
    let not_validated = match max_validated_pairs {
        Some(max) if pairs.len() > max => {
            log::warn!(
                "Only {} out of {} candidate merges are validated",
                max,
                pairs.len()
            );
            pairs.split_off(max)
        }
        _ => vec![],
    };

    let simulate = |&(i, j): &(usize, usize)| {
        let merged = simulate_merge(
            analyzer.spike_train(i),
            analyzer.spike_train(j),
            sampling_frequency,
            num_samples,
            window,
        );
        let score_1 = quality_score(firing_rates[i], contaminations[i], firing_contamination_balance);
        let score_2 = quality_score(firing_rates[j], contaminations[j], firing_contamination_balance);
        let score_new = quality_score(merged.firing_rate, merged.contamination, firing_contamination_balance);
        (score_new, score_new >= score_1 && score_new >= score_2)
    };
    let outcomes: Vec<(f64, bool)> = if pairs.len() >= MIN_PAIRS_PAR {
        pairs.par_iter().map(simulate).collect()
    } else {
        pairs.iter().map(simulate).collect()
    };

    let num_units = candidates.num_units();
    let mut merged_scores = DMatrix::from_element(num_units, num_units, f64::NAN);
    let mut validation = Validation::default();
    for (&(i, j), (score_new, improved)) in pairs.iter().zip(outcomes) {
        merged_scores[(i, j)] = score_new;
        if !improved {
            candidates.clear(i, j);
            validation.pairs_decreased_score.push((i, j));
        }
    }
    for &(i, j) in not_validated.iter() {
        candidates.clear(i, j);
    }
    validation.pairs_not_validated = not_validated;

    (validation, merged_scores)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::analyzer::{MemoryAnalyzer, Recording, UnitRecord};

    const SEED: u64 = 42;
    const FS: f64 = 30_000.0;
    const NUM_SAMPLES: u64 = 30_000 * 200;

    #[test]
    fn test_quality_score() {
        assert_relative_eq!(quality_score(10.0, 0.0, 2.5), 10.0);
        assert_relative_eq!(quality_score(10.0, 0.1, 2.5), 6.5, epsilon = 1e-12);
        assert!(quality_score(10.0, 1.0, 2.5) < 0.0);
    }

    #[test]
    fn test_simulate_merge() {
        let spike_train_1 = SpikeTrain::build(&[0, 1_000, 2_000]);
        let spike_train_2 = SpikeTrain::build(&[5, 1_500]);
        let merged = simulate_merge(
            &spike_train_1,
            &spike_train_2,
            FS,
            NUM_SAMPLES,
            &RefractoryWindow::default(),
        );
        // The spike 5 samples after the first one is within the censored period (9 samples)
        assert_eq!(merged.spike_train.samples(), &[0, 1_000, 1_500, 2_000]);
        assert_relative_eq!(merged.firing_rate, 4.0 / 200.0);
        assert_relative_eq!(merged.contamination, 0.0);
        // The inputs are untouched
        assert_eq!(spike_train_2.num_spikes(), 2);
    }

    fn split_and_shifted_analyzer() -> MemoryAnalyzer {
        let mut rng = StdRng::seed_from_u64(SEED);
        let spike_train = SpikeTrain::rand_poisson(20.0, 60, FS, NUM_SAMPLES - 100, &mut rng).unwrap();
        let halves: Vec<Vec<i64>> = (0..2)
            .map(|r| {
                spike_train
                    .samples()
                    .iter()
                    .enumerate()
                    .filter(|(n, _)| n % 2 == r)
                    .map(|(_, &t)| t)
                    .collect()
            })
            .collect();
        // A copy of the whole unit, 0.5 ms late, violates the refractory period of both halves on merge
        let shifted: Vec<i64> = spike_train.samples().iter().map(|t| t + 15).collect();

        MemoryAnalyzer::from_recording(Recording::new(
            FS,
            NUM_SAMPLES,
            vec![
                UnitRecord::new("0", SpikeTrain::build(&halves[0])),
                UnitRecord::new("1", SpikeTrain::build(&halves[1])),
                UnitRecord::new("2", SpikeTrain::build(&shifted)),
            ],
        ))
        .unwrap()
    }

    #[test]
    fn test_check_improve_contaminations_score() {
        let analyzer = split_and_shifted_analyzer();
        let window = RefractoryWindow::default();
        let contaminations = analyzer.contaminations(&window);
        let mut candidates = CandidateMatrix::new(3);

        let (validation, merged_scores) =
            check_improve_contaminations_score(&analyzer, &mut candidates, &contaminations, 2.5, &window, None);

        // Merging the two halves restores the original unit, merging with the shifted copy contaminates it
        assert_eq!(candidates.pairs(), vec![(0, 1)]);
        assert_eq!(validation.pairs_decreased_score, vec![(0, 2), (1, 2)]);
        assert!(validation.pairs_not_validated.is_empty());
        assert!(merged_scores[(0, 1)] > 0.0);
        assert!(merged_scores[(0, 2)] < 0.0);
        assert!(merged_scores[(1, 0)].is_nan());
    }

    #[test]
    fn test_bounded_validation() {
        let analyzer = split_and_shifted_analyzer();
        let window = RefractoryWindow::default();
        let contaminations = analyzer.contaminations(&window);
        let mut candidates = CandidateMatrix::new(3);

        let (validation, merged_scores) = check_improve_contaminations_score(
            &analyzer,
            &mut candidates,
            &contaminations,
            2.5,
            &window,
            Some(1),
        );

        assert_eq!(candidates.pairs(), vec![(0, 1)]);
        assert!(validation.pairs_decreased_score.is_empty());
        assert_eq!(validation.pairs_not_validated, vec![(0, 2), (1, 2)]);
        assert!(merged_scores[(0, 2)].is_nan());
    }
}
