//! Refractory period violations, contamination and cross-contamination estimates.
//!
//! The contamination of a unit is estimated from the number of spike pairs closer than the refractory
//! period, relative to what a Poisson process of the same rate would produce, accounting for the
//! censored period during which the sorter cannot detect two spikes.
use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, DiscreteCDF};

use crate::error::MergeError;
use crate::spike_train::SpikeTrain;

/// The censored and refractory periods (in ms) used to count violations.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct RefractoryWindow {
    pub censored_period_ms: f64,
    pub refractory_period_ms: f64,
}

impl Default for RefractoryWindow {
    fn default() -> Self {
        RefractoryWindow {
            censored_period_ms: 0.3,
            refractory_period_ms: 1.0,
        }
    }
}

impl RefractoryWindow {
    /// Create a refractory window. Returns an error if the refractory period does not exceed the censored one.
    pub fn build(censored_period_ms: f64, refractory_period_ms: f64) -> Result<Self, MergeError> {
        let window = RefractoryWindow {
            censored_period_ms,
            refractory_period_ms,
        };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<(), MergeError> {
        if !(self.censored_period_ms >= 0.0) || !(self.refractory_period_ms > self.censored_period_ms) {
            return Err(MergeError::InvalidParameter(format!(
                "The refractory period ({} ms) must exceed the non-negative censored period ({} ms)",
                self.refractory_period_ms, self.censored_period_ms
            )));
        }
        Ok(())
    }

    /// Returns the censored and refractory periods in samples.
    pub fn to_samples(&self, sampling_frequency: f64) -> (i64, i64) {
        let t_c = (self.censored_period_ms * sampling_frequency * 1e-3).round() as i64;
        let t_r = (self.refractory_period_ms * sampling_frequency * 1e-3).round() as i64;
        (t_c, t_r)
    }

    /// Returns a stable key to memoize computations done with this window.
    pub fn key(&self) -> (u64, u64) {
        (
            self.censored_period_ms.to_bits(),
            self.refractory_period_ms.to_bits(),
        )
    }
}

/// Estimate the contamination of a unit from its refractory period violations.
/// Returns NaN for an empty spike train.
pub fn refractory_contamination(
    spike_train: &SpikeTrain,
    sampling_frequency: f64,
    num_samples: u64,
    window: &RefractoryWindow,
) -> f64 {
    let (t_c, t_r) = window.to_samples(sampling_frequency);
    let num_spikes = spike_train.num_spikes() as f64;
    if num_spikes == 0.0 || t_r <= t_c {
        return f64::NAN;
    }

    let num_violations = spike_train.num_refractory_violations(t_r) as f64;
    let d = 1.0
        - num_violations * (num_samples as f64 - 2.0 * num_spikes * t_c as f64)
            / (num_spikes * num_spikes * (t_r - t_c) as f64);

    if d >= 0.0 {
        1.0 - d.sqrt()
    } else {
        1.0
    }
}

/// Firing rate (in Hz) of every spike train.
pub fn firing_rates(spike_trains: &[&SpikeTrain], sampling_frequency: f64, num_samples: u64) -> Vec<f64> {
    spike_trains
        .iter()
        .map(|spike_train| spike_train.firing_rate(sampling_frequency, num_samples))
        .collect()
}

/// A cross-contamination estimate together with its significance.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct CrossContamination {
    /// The estimated fraction of the second train which does not respect the refractory period of the first.
    pub estimate: f64,
    /// The probability of observing at least as many coincidences if the cross-contamination was the limit.
    pub p_value: f64,
}

/// Estimate the cross-contamination of the second spike train with the unit of the first one.
///
/// The coincidences are counted between the censored and the refractory period. Under the hypothesis
/// that the cross-contamination equals `limit`, their number follows a binomial law, from which the
/// p-value of the observed count is derived.
pub fn cross_contamination(
    spike_train_1: &SpikeTrain,
    spike_train_2: &SpikeTrain,
    sampling_frequency: f64,
    num_samples: u64,
    window: &RefractoryWindow,
    limit: f64,
) -> CrossContamination {
    let (t_c, t_r) = window.to_samples(sampling_frequency);
    let n1 = spike_train_1.num_spikes() as f64;
    let n2 = spike_train_2.num_spikes() as f64;
    let total = num_samples as f64;

    if n1 == 0.0 || n2 == 0.0 || t_r <= t_c || total <= 0.0 {
        return CrossContamination {
            estimate: f64::NAN,
            p_value: f64::NAN,
        };
    }

    let c1 = refractory_contamination(spike_train_1, sampling_frequency, num_samples, window);
    let num_violations = spike_train_1.num_coincidences(spike_train_2, t_r)
        - spike_train_1.num_coincidences(spike_train_2, t_c);
    let width = (t_r - t_c) as f64;

    let estimate = if c1 == 1.0 {
        f64::NEG_INFINITY
    } else {
        1.0 - ((num_violations as f64 * total) / (2.0 * n1 * n2 * width) - 1.0) / (c1 - 1.0)
    };

    let p_value = if num_violations == 0 {
        1.0
    } else {
        let n = (n1 * n2 * ((1.0 - c1) * limit + c1)).round().max(0.0) as u64;
        let p = (2.0 * width / total).clamp(0.0, 1.0);
        match Binomial::new(p, n) {
            Ok(binomial) => binomial.sf(num_violations as u64 - 1),
            Err(_) => f64::NAN,
        }
    };

    CrossContamination { estimate, p_value }
}
