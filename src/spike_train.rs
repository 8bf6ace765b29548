//! Module implementing the concept of a unit spike train, i.e., the sorted sample indices at which a unit fires.

use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::error::MergeError;

/// Represents the spike train of a single unit, as sample indices in the recording.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<i64>", into = "Vec<i64>")]
pub struct SpikeTrain {
    samples: Vec<i64>,
}

impl From<Vec<i64>> for SpikeTrain {
    fn from(mut samples: Vec<i64>) -> Self {
        samples.sort_unstable();
        SpikeTrain { samples }
    }
}

impl From<SpikeTrain> for Vec<i64> {
    fn from(spike_train: SpikeTrain) -> Self {
        spike_train.samples
    }
}

impl SpikeTrain {
    /// Create a spike train from sample indices.
    /// If necessary, the sample indices are sorted.
    pub fn build(samples: &[i64]) -> Self {
        SpikeTrain::from(samples.to_vec())
    }

    /// Returns the sample indices of the spike train.
    pub fn samples(&self) -> &[i64] {
        &self.samples[..]
    }

    /// Returns the number of spikes.
    pub fn num_spikes(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the firing rate in Hz over a recording of `num_samples` samples.
    pub fn firing_rate(&self, sampling_frequency: f64, num_samples: u64) -> f64 {
        let duration = num_samples as f64 / sampling_frequency;
        self.num_spikes() as f64 / duration
    }

    /// Count the pairs of spikes which are at most `t_r` samples apart.
    pub fn num_refractory_violations(&self, t_r: i64) -> usize {
        let mut num_violations = 0;
        for (i, &t) in self.samples.iter().enumerate() {
            num_violations += self.samples[i + 1..]
                .iter()
                .take_while(|&&other| other - t <= t_r)
                .count();
        }
        num_violations
    }

    /// Count the pairs of spikes (one from each train) which are at most `max_lag` samples apart.
    pub fn num_coincidences(&self, other: &SpikeTrain, max_lag: i64) -> usize {
        let mut start = 0;
        let mut num_coincidences = 0;
        for &t in self.samples.iter() {
            while start < other.samples.len() && other.samples[start] < t - max_lag {
                start += 1;
            }
            num_coincidences += other.samples[start..]
                .iter()
                .take_while(|&&other_t| other_t <= t + max_lag)
                .count();
        }
        num_coincidences
    }

    /// Returns the union of two spike trains, where every spike following the previously kept one
    /// by `delta` samples or fewer is dropped.
    pub fn merge_with(&self, other: &SpikeTrain, delta: i64) -> SpikeTrain {
        let mut samples: Vec<i64> = Vec::with_capacity(self.num_spikes() + other.num_spikes());
        let (mut i, mut j) = (0, 0);
        while i < self.samples.len() || j < other.samples.len() {
            let next = match (self.samples.get(i), other.samples.get(j)) {
                (Some(&a), Some(&b)) if a <= b => {
                    i += 1;
                    a
                }
                (Some(_), Some(&b)) => {
                    j += 1;
                    b
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (None, Some(&b)) => {
                    j += 1;
                    b
                }
                (None, None) => break,
            };
            match samples.last() {
                Some(&last) if next - last <= delta => {}
                _ => samples.push(next),
            }
        }
        SpikeTrain { samples }
    }

    /// Samples a Poisson spike train with a dead time (in samples) after every spike.
    ///
    /// # Parameters
    /// - `rate`: The firing rate (in Hz) of the underlying Poisson process.
    /// - `dead_time`: The minimum number of samples between two consecutive spikes.
    /// - `sampling_frequency`: The sampling frequency (in Hz) of the recording.
    /// - `num_samples`: The duration of the recording (in samples).
    /// - `rng`: A mutable reference to a random number generator implementing the `Rng` trait.
    pub fn rand_poisson<R: Rng>(
        rate: f64,
        dead_time: i64,
        sampling_frequency: f64,
        num_samples: u64,
        rng: &mut R,
    ) -> Result<Self, MergeError> {
        if rate <= 0.0 {
            return Err(MergeError::InvalidParameter(
                "Invalid firing rate value: must be positive".to_string(),
            ));
        }
        if sampling_frequency <= 0.0 {
            return Err(MergeError::InvalidParameter(
                "Invalid sampling frequency: must be positive".to_string(),
            ));
        }

        let isi = Exp::new(rate / sampling_frequency)
            .map_err(|e| MergeError::InvalidParameter(e.to_string()))?;

        let mut samples = vec![];
        let mut t = isi.sample(rng).round() as i64;
        while t < num_samples as i64 {
            samples.push(t);
            t += dead_time.max(1) + isi.sample(rng).round() as i64;
        }

        Ok(SpikeTrain { samples })
    }
}
