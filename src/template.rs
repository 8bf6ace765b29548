//! Average waveform templates and the shift-tolerant template distance.
//!
//! # Examples
//!
//! ```rust
//! use approx::assert_relative_eq;
//! use unit_merge::template::{template_distance, Template, TemplateMetric};
//!
//! let rows: Vec<Vec<f64>> = (0..20).map(|t| vec![0.0, if t == 10 { -5.0 } else { 0.0 }]).collect();
//! let template = Template::from_rows(&rows).unwrap();
//!
//! // A template is at distance zero from itself, whatever the metric
//! let d = template_distance(&template, &template, &[0, 1], 3, TemplateMetric::L1);
//! assert_relative_eq!(d, 0.0);
//! ```

use std::convert::TryFrom;
use std::fmt;

use itertools::Itertools;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::candidates::CandidateMatrix;
use crate::error::MergeError;
use crate::location::PeakSign;

/// The metric used to compare two templates.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateMetric {
    /// Sum of absolute differences, normalized by the total absolute amplitude.
    L1,
    /// Euclidean norm of the difference, normalized by the summed squared norms.
    L2,
    /// One minus the normalized inner product.
    Cosine,
}

impl TemplateMetric {
    /// Returns the template metric from a string.
    pub fn from_str(s: &str) -> Result<Self, MergeError> {
        match s {
            "l1" => Ok(TemplateMetric::L1),
            "l2" => Ok(TemplateMetric::L2),
            "cosine" => Ok(TemplateMetric::Cosine),
            _ => Err(MergeError::UnsupportedMetric(s.to_string())),
        }
    }
}

impl fmt::Display for TemplateMetric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TemplateMetric::L1 => write!(f, "l1"),
            TemplateMetric::L2 => write!(f, "l2"),
            TemplateMetric::Cosine => write!(f, "cosine"),
        }
    }
}

/// The average waveform of a unit, with one row per time sample and one column per channel.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct Template {
    waveform: DMatrix<f64>,
}

impl TryFrom<Vec<Vec<f64>>> for Template {
    type Error = MergeError;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        Template::from_rows(&rows)
    }
}

impl From<Template> for Vec<Vec<f64>> {
    fn from(template: Template) -> Self {
        template
            .waveform
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect()
    }
}

impl Template {
    /// Create a template from a (num_samples x num_channels) matrix.
    pub fn new(waveform: DMatrix<f64>) -> Self {
        Template { waveform }
    }

    /// Create a template from its rows, i.e., one vector of channel values per time sample.
    /// Returns an error if the rows do not all have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, MergeError> {
        let num_channels = rows.first().map(|row| row.len()).unwrap_or(0);
        if rows.iter().any(|row| row.len() != num_channels) {
            return Err(MergeError::IncompatibleData(
                "All template samples must have the same number of channels".to_string(),
            ));
        }
        let waveform = DMatrix::from_fn(rows.len(), num_channels, |t, c| rows[t][c]);
        Ok(Template { waveform })
    }

    /// Returns the underlying (num_samples x num_channels) matrix.
    pub fn waveform(&self) -> &DMatrix<f64> {
        &self.waveform
    }

    pub fn num_samples(&self) -> usize {
        self.waveform.nrows()
    }

    pub fn num_channels(&self) -> usize {
        self.waveform.ncols()
    }

    /// Returns the channel with the largest peak of the given sign, if any.
    pub fn extremum_channel(&self, peak_sign: PeakSign) -> Option<usize> {
        self.waveform
            .column_iter()
            .map(|channel| match peak_sign {
                PeakSign::Neg => -channel.min(),
                PeakSign::Pos => channel.max(),
                PeakSign::Both => channel.amax(),
            })
            .position_max_by(|a, b| a.total_cmp(b))
    }
}

/// Select the channels on which two templates are compared.
///
/// With `num_channels = Some(k)`, the `k` channels with the largest peak of `|t1 + t2|` are kept.
/// Otherwise, if both sparsity masks are provided, their intersection is used, else all channels.
pub fn select_channels(
    template_1: &Template,
    template_2: &Template,
    num_channels: Option<usize>,
    masks: Option<(&[bool], &[bool])>,
) -> Vec<usize> {
    match (num_channels, masks) {
        (None, Some((mask_1, mask_2))) => mask_1
            .iter()
            .zip(mask_2.iter())
            .positions(|(&a, &b)| a && b)
            .collect(),
        (num_channels, _) => {
            let sum = template_1.waveform() + template_2.waveform();
            let peaks: Vec<f64> = sum.column_iter().map(|channel| channel.amax()).collect();
            (0..peaks.len())
                .sorted_by(|&a, &b| peaks[b].total_cmp(&peaks[a]))
                .take(num_channels.unwrap_or(peaks.len()))
                .collect()
        }
    }
}

/// Returns the distance between two templates restricted to the given channels, minimized over
/// integer time shifts in `[-num_shift, num_shift]`.
///
/// The first template is compared on its central samples `[num_shift, num_samples - num_shift)`,
/// the second one on the same window moved by the shift. An empty channel selection or a zero
/// normalization yields the maximal distance 1.
pub fn template_distance(
    template_1: &Template,
    template_2: &Template,
    channels: &[usize],
    num_shift: usize,
    metric: TemplateMetric,
) -> f64 {
    if channels.is_empty() {
        return 1.0;
    }

    let t1 = template_1.waveform().select_columns(channels);
    let t2 = template_2.waveform().select_columns(channels);
    let num_samples = t1.nrows().min(t2.nrows());
    if num_samples <= 2 * num_shift {
        return 1.0;
    }

    let norm = match metric {
        TemplateMetric::L1 => t1.abs().sum() + t2.abs().sum(),
        TemplateMetric::L2 => t1.norm_squared() + t2.norm_squared(),
        TemplateMetric::Cosine => t1.norm() * t2.norm(),
    };
    if norm <= 0.0 || !norm.is_finite() {
        return 1.0;
    }

    let len = num_samples - 2 * num_shift;
    let temp1 = t1.rows(num_shift, len);

    (0..=2 * num_shift)
        .map(|offset| {
            let temp2 = t2.rows(offset, len);
            match metric {
                TemplateMetric::L1 => (&temp1 - &temp2).abs().sum() / norm,
                TemplateMetric::L2 => (&temp1 - &temp2).norm() / norm,
                TemplateMetric::Cosine => 1.0 - temp1.dot(&temp2) / norm,
            }
        })
        .fold(f64::INFINITY, f64::min)
}

/// Compute the template distance of every candidate pair.
/// The returned matrix is NaN outside of the candidate pairs.
pub fn compute_templates_diff(
    templates: &[Template],
    sparsity: Option<&[Vec<bool>]>,
    candidates: &CandidateMatrix,
    num_channels: Option<usize>,
    num_shift: usize,
    metric: TemplateMetric,
) -> DMatrix<f64> {
    candidates.map_pairs(|i, j| {
        let masks = sparsity.map(|masks| (&masks[i][..], &masks[j][..]));
        let channels = select_channels(&templates[i], &templates[j], num_channels, masks);
        if channels.is_empty() {
            log::warn!(
                "Units {} and {} share no channel, their template distance is maximal",
                i,
                j
            );
        }
        template_distance(&templates[i], &templates[j], &channels, num_shift, metric)
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    const NUM_SAMPLES: usize = 30;
    const NUM_CHANNELS: usize = 4;

    /// A spike-like waveform centered in the template, zero on the borders.
    fn waveform(amplitude: f64, channel: usize) -> Template {
        Template::new(DMatrix::from_fn(NUM_SAMPLES, NUM_CHANNELS, |t, c| {
            if c != channel {
                return 0.0;
            }
            let dt = t as f64 - NUM_SAMPLES as f64 / 2.0;
            -amplitude * (-dt * dt).exp()
        }))
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!(TemplateMetric::from_str("l1"), Ok(TemplateMetric::L1));
        assert_eq!(TemplateMetric::from_str("cosine"), Ok(TemplateMetric::Cosine));
        assert_eq!(
            TemplateMetric::from_str("l3"),
            Err(MergeError::UnsupportedMetric("l3".to_string()))
        );
    }

    #[test]
    fn test_identical_templates() {
        let template = waveform(10.0, 1);
        let channels = select_channels(&template, &template, Some(2), None);
        for metric in [TemplateMetric::L1, TemplateMetric::L2, TemplateMetric::Cosine] {
            assert_relative_eq!(
                template_distance(&template, &template, &channels, 5, metric),
                0.0,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_empty_intersection_is_maximal() {
        let template_1 = waveform(10.0, 0);
        let template_2 = waveform(10.0, 3);
        let mask_1 = vec![true, true, false, false];
        let mask_2 = vec![false, false, true, true];
        let channels = select_channels(&template_1, &template_2, None, Some((&mask_1, &mask_2)));
        assert!(channels.is_empty());
        for metric in [TemplateMetric::L1, TemplateMetric::L2, TemplateMetric::Cosine] {
            assert_eq!(
                template_distance(&template_1, &template_2, &channels, 5, metric),
                1.0
            );
        }
    }

    #[test]
    fn test_disjoint_channels() {
        let template_1 = waveform(10.0, 0);
        let template_2 = waveform(10.0, 3);
        let channels = select_channels(&template_1, &template_2, Some(2), None);
        assert_eq!(channels.len(), 2);
        assert!(channels.contains(&0) && channels.contains(&3));
        assert_relative_eq!(
            template_distance(&template_1, &template_2, &channels, 5, TemplateMetric::L1),
            1.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            template_distance(&template_1, &template_2, &channels, 5, TemplateMetric::Cosine),
            1.0,
            epsilon = 1e-9
        );

        // L2 is not bounded by 1: disjoint templates sit at 1 / sqrt(||t1||^2 + ||t2||^2)
        let energy = template_1.waveform().norm_squared() + template_2.waveform().norm_squared();
        assert_relative_eq!(
            template_distance(&template_1, &template_2, &channels, 5, TemplateMetric::L2),
            energy.sqrt() / energy,
            epsilon = 1e-9
        );
        assert!(template_distance(&template_1, &template_2, &channels, 5, TemplateMetric::L2) < 1.0);
    }

    #[test]
    fn test_shift_tolerance() {
        let template_1 = waveform(10.0, 2);
        let shifted = Template::new(DMatrix::from_fn(NUM_SAMPLES, NUM_CHANNELS, |t, c| {
            if t < 2 {
                0.0
            } else {
                template_1.waveform()[(t - 2, c)]
            }
        }));
        let channels = select_channels(&template_1, &shifted, Some(1), None);
        assert_eq!(channels, vec![2]);

        // Not tolerated without shifts, tolerated with enough of them
        let d0 = template_distance(&template_1, &shifted, &channels, 0, TemplateMetric::L1);
        let d5 = template_distance(&template_1, &shifted, &channels, 5, TemplateMetric::L1);
        assert!(d0 > 0.1);
        assert_relative_eq!(d5, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_amplitude_mismatch() {
        let template_1 = waveform(10.0, 1);
        let template_2 = waveform(100.0, 1);
        let channels = select_channels(&template_1, &template_2, Some(5), None);
        // 9 / 11 of the total absolute amplitude is not shared
        assert_relative_eq!(
            template_distance(&template_1, &template_2, &channels, 5, TemplateMetric::L1),
            9.0 / 11.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_extremum_channel() {
        let mut waveform = DMatrix::zeros(5, 3);
        waveform[(2, 0)] = -4.0;
        waveform[(2, 1)] = 6.0;
        waveform[(3, 2)] = -5.0;
        let template = Template::new(waveform);
        assert_eq!(template.extremum_channel(PeakSign::Neg), Some(2));
        assert_eq!(template.extremum_channel(PeakSign::Pos), Some(1));
        assert_eq!(template.extremum_channel(PeakSign::Both), Some(1));
    }

    #[test]
    fn test_compute_templates_diff() {
        let templates = vec![waveform(10.0, 0), waveform(10.0, 0), waveform(10.0, 3)];
        let mut candidates = CandidateMatrix::new(3);
        candidates.clear(1, 2);
        let diff = compute_templates_diff(&templates, None, &candidates, Some(2), 5, TemplateMetric::L1);
        assert_relative_eq!(diff[(0, 1)], 0.0, epsilon = 1e-9);
        assert_relative_eq!(diff[(0, 2)], 1.0, epsilon = 1e-9);
        assert!(diff[(1, 2)].is_nan());
    }
}
