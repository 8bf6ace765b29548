//! Unit locations and pairwise distances.
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::template::Template;

/// The sign of the peak used to find the extremum channel of a template.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakSign {
    /// Most negative peak.
    Neg,
    /// Most positive peak.
    Pos,
    /// Largest absolute peak.
    Both,
}

impl PeakSign {
    /// Returns the peak sign from a string.
    pub fn from_str(s: &str) -> Result<Self, MergeError> {
        match s {
            "neg" => Ok(PeakSign::Neg),
            "pos" => Ok(PeakSign::Pos),
            "both" => Ok(PeakSign::Both),
            _ => Err(MergeError::InvalidParameter(format!(
                "Invalid peak sign {}: must be one of neg, pos, both",
                s
            ))),
        }
    }
}

/// Estimate the location of every unit as the location of the channel where its template peaks.
pub fn locations_from_templates(
    templates: &[Template],
    channel_locations: &[[f64; 2]],
    peak_sign: PeakSign,
) -> Result<Vec<[f64; 2]>, MergeError> {
    templates
        .iter()
        .enumerate()
        .map(|(unit_index, template)| {
            template
                .extremum_channel(peak_sign)
                .and_then(|channel| channel_locations.get(channel).copied())
                .ok_or_else(|| {
                    MergeError::IncompatibleData(format!(
                        "No channel location for the extremum channel of unit {}",
                        unit_index
                    ))
                })
        })
        .collect()
}

/// Returns the matrix of pairwise euclidean distances between locations.
pub fn distance_matrix(locations: &[[f64; 2]]) -> DMatrix<f64> {
    DMatrix::from_fn(locations.len(), locations.len(), |i, j| {
        let dx = locations[i][0] - locations[j][0];
        let dy = locations[i][1] - locations[j][1];
        dx.hypot(dy)
    })
}
