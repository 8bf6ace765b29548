//! The analyzer, which provides the per-unit data the merge pipeline consumes.
//!
//! Spike trains and the recording metadata are mandatory. Templates, locations, sparsity masks,
//! template similarities and spike features are optional extensions: the stages which need them fall
//! back to another source when possible and fail at preflight otherwise. Contaminations and correlograms
//! are computed on demand and memoized, so that repeated stages and repeated runs do not recompute them.
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use derivative::Derivative;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::contamination::{refractory_contamination, RefractoryWindow};
use crate::correlogram::{compute_correlograms, Correlograms};
use crate::error::MergeError;
use crate::knn::Feature;
use crate::spike_train::SpikeTrain;
use crate::template::Template;
use crate::MIN_PAIRS_PAR;

/// The data source of the merge pipeline.
pub trait Analyzer: Sync {
    /// Returns the unit identifiers, in unit index order.
    fn unit_ids(&self) -> &[String];

    fn num_units(&self) -> usize {
        self.unit_ids().len()
    }

    /// Returns the sampling frequency (in Hz).
    fn sampling_frequency(&self) -> f64;

    /// Returns the duration of the recording (in samples).
    fn num_samples(&self) -> u64;

    fn spike_train(&self, unit_index: usize) -> &SpikeTrain;

    fn spike_trains(&self) -> Vec<&SpikeTrain> {
        (0..self.num_units()).map(|i| self.spike_train(i)).collect()
    }

    fn num_spikes(&self) -> Vec<usize> {
        (0..self.num_units())
            .map(|i| self.spike_train(i).num_spikes())
            .collect()
    }

    /// Returns the firing rate (in Hz) of every unit.
    fn firing_rates(&self) -> Vec<f64> {
        (0..self.num_units())
            .map(|i| {
                self.spike_train(i)
                    .firing_rate(self.sampling_frequency(), self.num_samples())
            })
            .collect()
    }

    /// Returns the refractory contamination of every unit.
    fn contaminations(&self, window: &RefractoryWindow) -> Vec<f64>;

    /// Returns the auto- and cross-correlograms of all units.
    fn correlograms(&self, window_ms: f64, bin_ms: f64) -> Result<Arc<Correlograms>, MergeError>;

    fn unit_locations(&self) -> Option<&[[f64; 2]]>;

    fn channel_locations(&self) -> Option<&[[f64; 2]]>;

    fn templates(&self) -> Option<&[Template]>;

    fn sparsity(&self) -> Option<&[Vec<bool>]>;

    /// Returns the precomputed template similarity matrix (1 for identical templates), if any.
    fn template_similarity(&self) -> Option<&DMatrix<f64>>;

    /// Returns the (amplitude, x, y) features of every spike of every unit, if any.
    fn spike_features(&self) -> Option<&[Vec<Feature>]>;
}

/// A unit as stored in a recording file.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: String,
    pub spike_train: SpikeTrain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparsity: Option<Vec<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spike_features: Option<Vec<Feature>>,
}

impl UnitRecord {
    pub fn new(id: impl Into<String>, spike_train: SpikeTrain) -> Self {
        UnitRecord {
            id: id.into(),
            spike_train,
            template: None,
            location: None,
            sparsity: None,
            spike_features: None,
        }
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_location(mut self, location: [f64; 2]) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_sparsity(mut self, sparsity: Vec<bool>) -> Self {
        self.sparsity = Some(sparsity);
        self
    }

    pub fn with_spike_features(mut self, spike_features: Vec<Feature>) -> Self {
        self.spike_features = Some(spike_features);
        self
    }
}

/// A sorted recording, i.e., the serialized form of a [`MemoryAnalyzer`].
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub sampling_frequency: f64,
    pub num_samples: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_locations: Option<Vec<[f64; 2]>>,
    pub units: Vec<UnitRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_similarity: Option<Vec<Vec<f64>>>,
}

impl Recording {
    pub fn new(sampling_frequency: f64, num_samples: u64, units: Vec<UnitRecord>) -> Self {
        Recording {
            sampling_frequency,
            num_samples,
            channel_locations: None,
            units,
            template_similarity: None,
        }
    }

    pub fn with_channel_locations(mut self, channel_locations: Vec<[f64; 2]>) -> Self {
        self.channel_locations = Some(channel_locations);
        self
    }

    /// Save the recording to a file in JSON format.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), MergeError> {
        let file = File::create(path).map_err(|e| MergeError::IOError(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|e| MergeError::IOError(e.to_string()))?;
        writer.flush().map_err(|e| MergeError::IOError(e.to_string()))
    }

    /// Load a recording from a JSON file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, MergeError> {
        let file = File::open(path).map_err(|e| MergeError::IOError(e.to_string()))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| MergeError::IOError(e.to_string()))
    }
}

/// Collect an optional per-unit field, which must be present for every unit or for none.
fn collect_extension<T: Clone>(
    units: &[UnitRecord],
    name: &str,
    field: impl Fn(&UnitRecord) -> Option<&T>,
) -> Result<Option<Vec<T>>, MergeError> {
    let values: Vec<&T> = units.iter().filter_map(&field).collect();
    if values.is_empty() {
        Ok(None)
    } else if values.len() == units.len() {
        Ok(Some(values.into_iter().cloned().collect()))
    } else {
        Err(MergeError::IncompatibleData(format!(
            "The {} extension is only available for {} out of {} units",
            name,
            values.len(),
            units.len()
        )))
    }
}

/// An in-memory analyzer with memoized contaminations and correlograms.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MemoryAnalyzer {
    unit_ids: Vec<String>,
    sampling_frequency: f64,
    num_samples: u64,
    spike_trains: Vec<SpikeTrain>,
    templates: Option<Vec<Template>>,
    unit_locations: Option<Vec<[f64; 2]>>,
    channel_locations: Option<Vec<[f64; 2]>>,
    sparsity: Option<Vec<Vec<bool>>>,
    spike_features: Option<Vec<Vec<Feature>>>,
    template_similarity: Option<DMatrix<f64>>,
    #[derivative(Debug = "ignore")]
    contaminations: Mutex<HashMap<(u64, u64), Vec<f64>>>,
    #[derivative(Debug = "ignore")]
    correlograms: Mutex<HashMap<(u64, u64), Arc<Correlograms>>>,
}

impl MemoryAnalyzer {
    /// Create an analyzer from a recording.
    /// Returns an error if the recording is inconsistent, e.g., if templates of different shapes are provided.
    pub fn from_recording(recording: Recording) -> Result<Self, MergeError> {
        if !(recording.sampling_frequency > 0.0) {
            return Err(MergeError::InvalidParameter(format!(
                "The sampling frequency must be positive, got {}",
                recording.sampling_frequency
            )));
        }
        if recording.num_samples == 0 {
            return Err(MergeError::InvalidParameter(
                "The recording must contain at least one sample".to_string(),
            ));
        }

        let units = recording.units;
        let mut seen = HashSet::new();
        if let Some(unit) = units.iter().find(|unit| !seen.insert(unit.id.as_str())) {
            return Err(MergeError::IncompatibleData(format!("Duplicate unit id {}", unit.id)));
        }

        let templates = collect_extension(&units, "templates", |unit| unit.template.as_ref())?;
        let unit_locations = collect_extension(&units, "unit_locations", |unit| unit.location.as_ref())?;
        let sparsity = collect_extension(&units, "sparsity", |unit| unit.sparsity.as_ref())?;
        let spike_features =
            collect_extension(&units, "spike_features", |unit| unit.spike_features.as_ref())?;

        if let Some(templates) = &templates {
            let shape = (templates[0].num_samples(), templates[0].num_channels());
            if templates
                .iter()
                .any(|template| (template.num_samples(), template.num_channels()) != shape)
            {
                return Err(MergeError::IncompatibleData(
                    "All templates must have the same shape".to_string(),
                ));
            }
            if let Some(sparsity) = &sparsity {
                if sparsity.iter().any(|mask| mask.len() != shape.1) {
                    return Err(MergeError::IncompatibleData(format!(
                        "Sparsity masks must have one entry per channel ({})",
                        shape.1
                    )));
                }
            }
        }

        if let Some(spike_features) = &spike_features {
            if let Some((unit, _)) = units
                .iter()
                .zip(spike_features.iter())
                .find(|(unit, features)| unit.spike_train.num_spikes() != features.len())
            {
                return Err(MergeError::IncompatibleData(format!(
                    "Unit {} must have one feature vector per spike",
                    unit.id
                )));
            }
        }

        let num_units = units.len();
        let template_similarity = match recording.template_similarity {
            Some(rows) => {
                if rows.len() != num_units || rows.iter().any(|row| row.len() != num_units) {
                    return Err(MergeError::IncompatibleData(format!(
                        "The template similarity must be a {} x {} matrix",
                        num_units, num_units
                    )));
                }
                Some(DMatrix::from_fn(num_units, num_units, |i, j| rows[i][j]))
            }
            None => None,
        };

        let (unit_ids, spike_trains): (Vec<String>, Vec<SpikeTrain>) = units
            .into_iter()
            .map(|unit| (unit.id, unit.spike_train))
            .unzip();

        Ok(MemoryAnalyzer {
            unit_ids,
            sampling_frequency: recording.sampling_frequency,
            num_samples: recording.num_samples,
            spike_trains,
            templates,
            unit_locations,
            channel_locations: recording.channel_locations,
            sparsity,
            spike_features,
            template_similarity,
            contaminations: Mutex::new(HashMap::new()),
            correlograms: Mutex::new(HashMap::new()),
        })
    }

    /// Load an analyzer from a recording JSON file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, MergeError> {
        MemoryAnalyzer::from_recording(Recording::load_from(path)?)
    }
}

impl Analyzer for MemoryAnalyzer {
    fn unit_ids(&self) -> &[String] {
        &self.unit_ids
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn num_samples(&self) -> u64 {
        self.num_samples
    }

    fn spike_train(&self, unit_index: usize) -> &SpikeTrain {
        &self.spike_trains[unit_index]
    }

    fn contaminations(&self, window: &RefractoryWindow) -> Vec<f64> {
        let mut cache = self
            .contaminations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .entry(window.key())
            .or_insert_with(|| {
                let compute = |spike_train: &SpikeTrain| {
                    refractory_contamination(spike_train, self.sampling_frequency, self.num_samples, window)
                };
                if self.spike_trains.len() >= MIN_PAIRS_PAR {
                    self.spike_trains.par_iter().map(compute).collect()
                } else {
                    self.spike_trains.iter().map(compute).collect()
                }
            })
            .clone()
    }

    fn correlograms(&self, window_ms: f64, bin_ms: f64) -> Result<Arc<Correlograms>, MergeError> {
        let key = (window_ms.to_bits(), bin_ms.to_bits());
        let mut cache = self
            .correlograms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(correlograms) = cache.get(&key) {
            return Ok(Arc::clone(correlograms));
        }

        log::debug!(
            "Computing correlograms of {} units ({} ms window, {} ms bins)",
            self.spike_trains.len(),
            window_ms,
            bin_ms
        );
        let spike_trains: Vec<&SpikeTrain> = self.spike_trains.iter().collect();
        let correlograms = Arc::new(compute_correlograms(
            &spike_trains,
            self.sampling_frequency,
            window_ms,
            bin_ms,
        )?);
        cache.insert(key, Arc::clone(&correlograms));
        Ok(correlograms)
    }

    fn unit_locations(&self) -> Option<&[[f64; 2]]> {
        self.unit_locations.as_deref()
    }

    fn channel_locations(&self) -> Option<&[[f64; 2]]> {
        self.channel_locations.as_deref()
    }

    fn templates(&self) -> Option<&[Template]> {
        self.templates.as_deref()
    }

    fn sparsity(&self) -> Option<&[Vec<bool>]> {
        self.sparsity.as_deref()
    }

    fn template_similarity(&self) -> Option<&DMatrix<f64>> {
        self.template_similarity.as_ref()
    }

    fn spike_features(&self) -> Option<&[Vec<Feature>]> {
        self.spike_features.as_deref()
    }
}
