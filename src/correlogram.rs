//! Auto- and cross-correlograms and the correlogram similarity between units.
//!
//! The correlograms of N units are stored as a dense (N, N, B) tensor: the entry `(i, j)` is the histogram
//! of the lags `t_i - t_j` between the spikes of unit `i` and those of unit `j`, the entry `(i, i)` is the
//! auto-correlogram of unit `i` (a spike is never paired with itself).
//!
//! # Examples
//!
//! ```rust
//! use unit_merge::correlogram::get_unit_adaptive_window;
//!
//! // An auto-correlogram with a single bump 5 bins left of its center (and its mirror)
//! let mut auto_corr = vec![0.0; 40];
//! auto_corr[15] = 10.0;
//! auto_corr[25] = 10.0;
//!
//! assert_eq!(get_unit_adaptive_window(&auto_corr, 5.0), 5);
//! ```

use std::sync::Arc;

use nalgebra::DMatrix;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::candidates::CandidateMatrix;
use crate::error::MergeError;
use crate::spike_train::SpikeTrain;
use crate::MIN_PAIRS_PAR;

/// The window (in bins) of a unit whose auto-correlogram is identically zero.
pub const DEFAULT_WINDOW_BINS: usize = 20;

/// A dense tensor of auto- and cross-correlograms.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Correlograms {
    num_units: usize,
    /// The bin edges (in ms), one more than the number of bins.
    bins: Vec<f64>,
    /// The counts, in (unit, unit, bin) order.
    data: Vec<f64>,
}

impl Correlograms {
    /// Create a correlogram tensor from its raw data.
    /// Returns an error if the data does not match the number of units and bins.
    pub fn from_data(num_units: usize, bins: Vec<f64>, data: Vec<f64>) -> Result<Self, MergeError> {
        let num_bins = bins.len().saturating_sub(1);
        if data.len() != num_units * num_units * num_bins {
            return Err(MergeError::IncompatibleData(format!(
                "Expected {} correlogram values for {} units and {} bins, got {}",
                num_units * num_units * num_bins,
                num_units,
                num_bins,
                data.len()
            )));
        }
        Ok(Correlograms {
            num_units,
            bins,
            data,
        })
    }

    /// Create an empty (all zero) correlogram tensor.
    pub fn zeros(num_units: usize, bins: Vec<f64>) -> Self {
        let num_bins = bins.len().saturating_sub(1);
        Correlograms {
            num_units,
            bins,
            data: vec![0.0; num_units * num_units * num_bins],
        }
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len().saturating_sub(1)
    }

    /// Returns the bin edges (in ms).
    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the correlogram of the pair (auto-correlogram if `i == j`).
    pub fn get(&self, i: usize, j: usize) -> &[f64] {
        let num_bins = self.num_bins();
        let start = (i * self.num_units + j) * num_bins;
        &self.data[start..start + num_bins]
    }

    pub fn get_mut(&mut self, i: usize, j: usize) -> &mut [f64] {
        let num_bins = self.num_bins();
        let start = (i * self.num_units + j) * num_bins;
        &mut self.data[start..start + num_bins]
    }

    /// Returns all auto-correlograms.
    pub fn autos(&self) -> Vec<&[f64]> {
        (0..self.num_units).map(|i| self.get(i, i)).collect()
    }

    fn rows_mut(&mut self) -> impl Iterator<Item = &mut [f64]> {
        let num_bins = self.num_bins().max(1);
        self.data.chunks_mut(num_bins)
    }

    fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = &mut [f64]> {
        let num_bins = self.num_bins().max(1);
        self.data.par_chunks_mut(num_bins)
    }
}

/// The window and bin sizes (in samples) of a correlogram.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct CorrelogramBinning {
    pub window_size: i64,
    pub bin_size: i64,
    pub num_bins: usize,
}

impl CorrelogramBinning {
    /// Convert a window and a bin size (in ms) to samples.
    /// The half window is truncated to a whole number of bins.
    /// Returns an error unless the window holds at least two bins of at least one sample each.
    pub fn build(sampling_frequency: f64, window_ms: f64, bin_ms: f64) -> Result<Self, MergeError> {
        for (name, value) in [("window_ms", window_ms), ("bin_ms", bin_ms)] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(MergeError::InvalidParameter(format!(
                    "The correlogram {} must be positive and finite, got {}",
                    name, value
                )));
            }
        }

        let window_size = (sampling_frequency * window_ms / 2.0 * 1e-3).round() as i64;
        let bin_size = (sampling_frequency * bin_ms * 1e-3).round() as i64;
        if bin_size < 1 {
            return Err(MergeError::InvalidParameter(format!(
                "The correlogram bin ({} ms) is shorter than one sample",
                bin_ms
            )));
        }
        let window_size = window_size - window_size % bin_size;
        let num_bins = usize::try_from(window_size / bin_size)
            .ok()
            .and_then(|half| half.checked_mul(2))
            .ok_or_else(|| {
                MergeError::InvalidParameter(format!(
                    "The correlogram window ({} ms) does not fit a number of bins of {} ms",
                    window_ms, bin_ms
                ))
            })?;
        if num_bins == 0 {
            return Err(MergeError::InvalidParameter(format!(
                "The correlogram window ({} ms) must contain at least two bins of {} ms",
                window_ms, bin_ms
            )));
        }
        Ok(CorrelogramBinning {
            window_size,
            bin_size,
            num_bins,
        })
    }

    /// Returns the bin edges (in ms).
    pub fn edges(&self, sampling_frequency: f64) -> Vec<f64> {
        (0..=self.num_bins as i64)
            .map(|b| (-self.window_size + b * self.bin_size) as f64 * 1e3 / sampling_frequency)
            .collect()
    }
}

/// Compute the auto- and cross-correlograms of all units.
pub fn compute_correlograms(
    spike_trains: &[&SpikeTrain],
    sampling_frequency: f64,
    window_ms: f64,
    bin_ms: f64,
) -> Result<Correlograms, MergeError> {
    let binning = CorrelogramBinning::build(sampling_frequency, window_ms, bin_ms)?;
    let mut correlograms = Correlograms::zeros(spike_trains.len(), binning.edges(sampling_frequency));

    let mut spikes: Vec<(i64, usize)> = spike_trains
        .iter()
        .enumerate()
        .flat_map(|(unit, spike_train)| spike_train.samples().iter().map(move |&t| (t, unit)))
        .collect();
    spikes.sort_unstable();

    let num_half_bins = (binning.num_bins / 2) as i64;
    let mut start = 0;
    for (i, &(t_i, unit_i)) in spikes.iter().enumerate() {
        while t_i - spikes[start].0 >= binning.window_size {
            start += 1;
        }
        for (j, &(t_j, unit_j)) in spikes.iter().enumerate().skip(start) {
            let diff = t_i - t_j;
            if diff < -binning.window_size {
                break;
            }
            if i == j {
                continue;
            }
            let bin = diff.div_euclid(binning.bin_size) + num_half_bins;
            correlograms.get_mut(unit_i, unit_j)[bin as usize] += 1.0;
        }
    }

    Ok(correlograms)
}

/// Zero every bin whose left edge lies in `[-censor_ms, censor_ms)`.
pub fn censor_correlograms(correlograms: &mut Correlograms, censor_ms: f64) {
    let censored: Vec<usize> = correlograms.bins()[..correlograms.num_bins()]
        .iter()
        .enumerate()
        .filter(|(_, &edge)| edge >= -censor_ms && edge < censor_ms)
        .map(|(b, _)| b)
        .collect();
    if censored.is_empty() {
        return;
    }
    for row in correlograms.rows_mut() {
        for &b in censored.iter() {
            row[b] = 0.0;
        }
    }
}

/// Smooth every correlogram by convolution with a normalized Gaussian kernel of width `sigma_ms`,
/// sampled at the bin edges. The output has the same length as the input.
pub fn smooth_correlograms(correlograms: &Correlograms, sigma_ms: f64) -> Correlograms {
    if correlograms.is_empty() {
        return correlograms.clone();
    }

    let mut kernel: Vec<f64> = correlograms
        .bins()
        .iter()
        .map(|edge| (-edge * edge / (2.0 * sigma_ms * sigma_ms)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= total);

    let convolver = SameConvolver::new(&kernel, correlograms.num_bins());
    let mut smoothed = correlograms.clone();
    let num_rows = smoothed.num_units() * smoothed.num_units();
    if num_rows >= MIN_PAIRS_PAR {
        smoothed.par_rows_mut().for_each(|row| convolver.apply(row));
    } else {
        smoothed.rows_mut().for_each(|row| convolver.apply(row));
    }
    smoothed
}

/// Discrete convolution with a fixed kernel, computed through the FFT, cropped to the length of the
/// signal and centered on the kernel.
struct SameConvolver {
    offset: usize,
    fft_len: usize,
    kernel_spectrum: Vec<Complex<f64>>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl SameConvolver {
    fn new(kernel: &[f64], signal_len: usize) -> Self {
        // Long enough for the full linear convolution, so that nothing wraps around
        let fft_len = (signal_len + kernel.len()).saturating_sub(1).max(1).next_power_of_two();
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);

        let mut kernel_spectrum = zero_padded(kernel, fft_len);
        forward.process(&mut kernel_spectrum);

        SameConvolver {
            offset: kernel.len().saturating_sub(1) / 2,
            fft_len,
            kernel_spectrum,
            forward,
            inverse,
        }
    }

    /// Convolve the signal in place.
    fn apply(&self, signal: &mut [f64]) {
        // Zero rows stay exactly zero
        if signal.iter().all(|&x| x == 0.0) {
            return;
        }

        let mut buffer = zero_padded(signal, self.fft_len);
        self.forward.process(&mut buffer);
        for (x, k) in buffer.iter_mut().zip(self.kernel_spectrum.iter()) {
            *x = *x * *k;
        }
        self.inverse.process(&mut buffer);

        let scale = 1.0 / self.fft_len as f64;
        for (b, x) in signal.iter_mut().enumerate() {
            *x = buffer[b + self.offset].re * scale;
        }
    }
}

fn zero_padded(values: &[f64], len: usize) -> Vec<Complex<f64>> {
    (0..len)
        .map(|k| Complex::new(values.get(k).copied().unwrap_or(0.0), 0.0))
        .collect()
}

/// Normalize a correlogram so that its mean is 1.
/// A correlogram which is zero everywhere stays zero everywhere.
pub fn normalize_correlogram(correlogram: &[f64]) -> Vec<f64> {
    if correlogram.is_empty() {
        return vec![];
    }
    let mean = correlogram.iter().sum::<f64>() / correlogram.len() as f64;
    if mean == 0.0 {
        correlogram.to_vec()
    } else {
        correlogram.iter().map(|x| x / mean).collect()
    }
}

/// Numerical gradient with central differences inside and one-sided differences at the borders.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| {
            if i == 0 {
                values[1] - values[0]
            } else if i == n - 1 {
                values[n - 1] - values[n - 2]
            } else {
                (values[i + 1] - values[i - 1]) / 2.0
            }
        })
        .collect()
}

/// Find the local maxima of a signal, i.e., samples strictly larger than both neighbours.
/// For flat peaks, the middle sample (rounded down) is reported. Borders are never peaks.
pub fn find_peaks(values: &[f64]) -> Vec<usize> {
    let mut peaks = vec![];
    if values.len() < 3 {
        return peaks;
    }
    let i_max = values.len() - 1;
    let mut i = 1;
    while i < i_max {
        if values[i - 1] < values[i] {
            let mut i_ahead = i + 1;
            while i_ahead < i_max && values[i_ahead] == values[i] {
                i_ahead += 1;
            }
            if values[i_ahead] < values[i] {
                peaks.push((i + i_ahead - 1) / 2);
                i = i_ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Computes the adaptive window (in bins) of an auto-correlogram, i.e., the distance from its center to the
/// nearest peak of concavity on its left whose correlogram value reaches the threshold.
///
/// If no such peak exists, the threshold is halved until one is found. The search gives up once the
/// threshold becomes negligible relative to the correlogram, and the default window is returned, as for an
/// auto-correlogram which is zero everywhere or a threshold which is not finite.
pub fn get_unit_adaptive_window(auto_corr: &[f64], threshold: f64) -> usize {
    let max_abs = auto_corr.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    if max_abs == 0.0 {
        return DEFAULT_WINDOW_BINS;
    }
    if !threshold.is_finite() {
        log::warn!("Invalid adaptive window threshold {}, using the default window", threshold);
        return DEFAULT_WINDOW_BINS;
    }

    let concavity: Vec<f64> = gradient(&gradient(auto_corr)).iter().map(|x| -x).collect();
    let center = auto_corr.len() / 2;
    let peaks: Vec<usize> = find_peaks(&concavity)
        .into_iter()
        .filter(|&peak| peak < center)
        .collect();

    let min_threshold = f64::EPSILON * max_abs;
    let mut threshold = threshold;
    loop {
        if let Some(&peak) = peaks.iter().rev().find(|&&peak| auto_corr[peak] >= threshold) {
            return center - peak;
        }
        if threshold <= min_threshold || peaks.is_empty() {
            log::debug!("No peak found in the auto-correlogram, using the default window");
            return DEFAULT_WINDOW_BINS;
        }
        threshold /= 2.0;
    }
}

/// Returns the normalized difference between the cross-correlogram of every candidate pair and the
/// auto-correlograms of its two units.
///
/// The comparison window is the spike-count weighted average of the two units' windows, and the two
/// per-unit differences are combined with the same weights. The returned matrix is NaN outside of
/// the candidate pairs.
pub fn compute_correlogram_diff(
    correlograms_smoothed: &Correlograms,
    win_sizes: &[usize],
    num_spikes: &[usize],
    candidates: &CandidateMatrix,
) -> DMatrix<f64> {
    let center = correlograms_smoothed.num_bins() / 2;

    candidates.map_pairs(|i, j| {
        let (n1, n2) = (num_spikes[i] as f64, num_spikes[j] as f64);
        if n1 + n2 == 0.0 {
            return f64::NAN;
        }
        let win_size =
            ((n1 * win_sizes[i] as f64 + n2 * win_sizes[j] as f64) / (n1 + n2)).round() as usize;
        let win_size = win_size.min(center);
        if win_size == 0 {
            return f64::NAN;
        }

        let auto_corr_1 = normalize_correlogram(correlograms_smoothed.get(i, i));
        let auto_corr_2 = normalize_correlogram(correlograms_smoothed.get(j, j));
        let cross_corr = normalize_correlogram(correlograms_smoothed.get(i, j));

        let window = (center - win_size)..(center + win_size);
        let mean_abs_diff = |auto_corr: &[f64]| {
            window
                .clone()
                .map(|b| (cross_corr[b] - auto_corr[b]).abs())
                .sum::<f64>()
                / window.len() as f64
        };
        let diff_1 = mean_abs_diff(&auto_corr_1);
        let diff_2 = mean_abs_diff(&auto_corr_2);

        (n1 * diff_1 + n2 * diff_2) / (n1 + n2)
    })
}
