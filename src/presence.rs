//! Presence distance, i.e., how differently two units are distributed over the recording.
//!
//! Each spike train is binned into a histogram of fixed-duration bins covering the whole recording and
//! normalized to unit mass. The presence distance of two units is the 1-D Wasserstein (earth mover's)
//! distance between their histograms, in seconds. Two halves of a unit which drifted or was split in
//! time are far apart, two units firing throughout the recording are close.
use nalgebra::DMatrix;

use crate::candidates::CandidateMatrix;
use crate::spike_train::SpikeTrain;

/// Returns the normalized presence histogram of a spike train, or None if the train is empty.
pub fn presence_histogram(
    spike_train: &SpikeTrain,
    sampling_frequency: f64,
    num_samples: u64,
    bin_duration_s: f64,
) -> Option<Vec<f64>> {
    if spike_train.is_empty() {
        return None;
    }

    let bin_size = ((bin_duration_s * sampling_frequency).round() as u64).max(1);
    let num_bins = num_samples.div_ceil(bin_size).max(1) as usize;

    let mut histogram = vec![0.0; num_bins];
    for &t in spike_train.samples() {
        let bin = (t.max(0) as u64 / bin_size) as usize;
        histogram[bin.min(num_bins - 1)] += 1.0;
    }
    let total = spike_train.num_spikes() as f64;
    histogram.iter_mut().for_each(|h| *h /= total);

    Some(histogram)
}

/// Wasserstein distance between two distributions supported on the same regular grid.
pub fn wasserstein_distance(u: &[f64], v: &[f64], bin_width: f64) -> f64 {
    let mut cdf_u = 0.0;
    let mut cdf_v = 0.0;
    let mut distance = 0.0;
    for (pu, pv) in u.iter().zip(v.iter()) {
        cdf_u += pu;
        cdf_v += pv;
        distance += (cdf_u - cdf_v).abs();
    }
    // The last cumulative difference is zero (up to rounding) and spans no interval
    let last = (cdf_u - cdf_v).abs();
    (distance - last) * bin_width
}

/// Returns the presence distance of every candidate pair, NaN elsewhere and for empty units.
pub fn compute_presence_distance(
    spike_trains: &[&SpikeTrain],
    sampling_frequency: f64,
    num_samples: u64,
    bin_duration_s: f64,
    candidates: &CandidateMatrix,
) -> DMatrix<f64> {
    let histograms: Vec<Option<Vec<f64>>> = spike_trains
        .iter()
        .map(|spike_train| presence_histogram(spike_train, sampling_frequency, num_samples, bin_duration_s))
        .collect();

    candidates.map_pairs(|i, j| match (&histograms[i], &histograms[j]) {
        (Some(h1), Some(h2)) => wasserstein_distance(h1, h2, bin_duration_s),
        _ => f64::NAN,
    })
}
