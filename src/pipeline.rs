//! The merge pipeline, a sequence of stages narrowing down the candidate pairs.
//!
//! Every stage is a variant of [`Stage`] carrying its own configuration. Stages run in the given order,
//! each one reading the candidate matrix left by its predecessors and clearing some of its pairs: a pair
//! which has been cleared is never a candidate again. The pairs surviving all stages are the proposed
//! merges.
//!
//! Before any stage runs, the whole sequence is checked: invalid parameters and missing analyzer
//! extensions are reported without computing anything.
//!
//! # Examples
//!
//! ```rust
//! use unit_merge::pipeline::{AutoMergeParams, Preset, StageKind};
//!
//! let params = AutoMergeParams {
//!     preset: Some("temporal_splits".to_string()),
//!     ..AutoMergeParams::default()
//! };
//! let stages = params.stages().unwrap();
//! assert_eq!(stages.len(), 7);
//! assert_eq!(stages[5].kind(), StageKind::PresenceDistance);
//!
//! assert_eq!(Preset::from_str("lussac").unwrap().stage_kinds()[4], StageKind::CrossContamination);
//! assert!(Preset::from_str("fast").is_err());
//! ```
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::analyzer::Analyzer;
use crate::candidates::CandidateMatrix;
use crate::contamination::{cross_contamination, RefractoryWindow};
use crate::correlogram::{
    censor_correlograms, compute_correlogram_diff, get_unit_adaptive_window, smooth_correlograms,
    CorrelogramBinning, Correlograms,
};
use crate::error::MergeError;
use crate::knn::{neighbor_units, restrict_to_neighbors, Feature, NeighborAlgorithm};
use crate::location::{distance_matrix, locations_from_templates, PeakSign};
use crate::presence::compute_presence_distance;
use crate::quality::check_improve_contaminations_score;
use crate::template::{compute_templates_diff, TemplateMetric};

/// The kinds of stages, in their canonical order.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    MinSpikes,
    RemoveContaminated,
    UnitPositions,
    Correlogram,
    TemplateSimilarity,
    PresenceDistance,
    Knn,
    CrossContamination,
    #[serde(rename = "check_increase_score")]
    QualityScore,
}

impl StageKind {
    pub const ALL: [StageKind; 9] = [
        StageKind::MinSpikes,
        StageKind::RemoveContaminated,
        StageKind::UnitPositions,
        StageKind::Correlogram,
        StageKind::TemplateSimilarity,
        StageKind::PresenceDistance,
        StageKind::Knn,
        StageKind::CrossContamination,
        StageKind::QualityScore,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::MinSpikes => "min_spikes",
            StageKind::RemoveContaminated => "remove_contaminated",
            StageKind::UnitPositions => "unit_positions",
            StageKind::Correlogram => "correlogram",
            StageKind::TemplateSimilarity => "template_similarity",
            StageKind::PresenceDistance => "presence_distance",
            StageKind::Knn => "knn",
            StageKind::CrossContamination => "cross_contamination",
            StageKind::QualityScore => "check_increase_score",
        }
    }

    /// Returns the stage kind from its name.
    pub fn from_str(s: &str) -> Result<Self, MergeError> {
        StageKind::ALL
            .iter()
            .find(|kind| kind.name() == s)
            .copied()
            .ok_or_else(|| MergeError::UnknownStage(s.to_string()))
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Canonical stage sequences.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Default,
    TemporalSplits,
    /// Cross-contamination instead of correlograms.
    Lussac,
    Knn,
}

impl Preset {
    pub fn from_str(s: &str) -> Result<Self, MergeError> {
        match s {
            "default" => Ok(Preset::Default),
            "temporal_splits" => Ok(Preset::TemporalSplits),
            "lussac" | "cross_contamination" => Ok(Preset::Lussac),
            "knn" => Ok(Preset::Knn),
            _ => Err(MergeError::UnknownPreset(s.to_string())),
        }
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        use StageKind::*;
        match self {
            Preset::Default => vec![
                MinSpikes,
                RemoveContaminated,
                UnitPositions,
                TemplateSimilarity,
                Correlogram,
                QualityScore,
            ],
            Preset::TemporalSplits => vec![
                MinSpikes,
                RemoveContaminated,
                UnitPositions,
                TemplateSimilarity,
                Correlogram,
                PresenceDistance,
                QualityScore,
            ],
            Preset::Lussac => vec![
                MinSpikes,
                RemoveContaminated,
                UnitPositions,
                TemplateSimilarity,
                CrossContamination,
                QualityScore,
            ],
            Preset::Knn => vec![
                MinSpikes,
                RemoveContaminated,
                UnitPositions,
                Knn,
                Correlogram,
                QualityScore,
            ],
        }
    }
}

fn check_positive(name: &str, value: f64) -> Result<(), MergeError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(MergeError::InvalidParameter(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), MergeError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MergeError::InvalidParameter(format!(
            "{} must be in [0, 1], got {}",
            name, value
        )))
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct MinSpikesConfig {
    pub minimum_spikes: usize,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ContaminationConfig {
    pub contamination_threshold: f64,
    pub window: RefractoryWindow,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct PositionsConfig {
    pub maximum_distance_um: f64,
    pub peak_sign: PeakSign,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct CorrelogramConfig {
    pub window_ms: f64,
    pub bin_ms: f64,
    pub censor_correlograms_ms: f64,
    pub sigma_smooth_ms: f64,
    pub adaptive_window_ratio: f64,
    pub corr_diff_thresh: f64,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct TemplateConfig {
    pub num_channels: Option<usize>,
    pub num_shift: usize,
    pub metric: TemplateMetric,
    pub template_diff_thresh: f64,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct PresenceConfig {
    pub bin_duration_s: f64,
    pub presence_distance_thresh: f64,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct KnnConfig {
    pub k_nn: usize,
    pub algorithm: NeighborAlgorithm,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct CrossContaminationConfig {
    pub window: RefractoryWindow,
    pub cc_threshold: f64,
    pub p_value: f64,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct QualityConfig {
    pub window: RefractoryWindow,
    pub firing_contamination_balance: f64,
    pub max_validated_pairs: Option<usize>,
}

/// A stage of the pipeline with its configuration.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Stage {
    /// Clear the units with fewer spikes than the minimum.
    MinSpikes(MinSpikesConfig),
    /// Clear the units whose refractory contamination exceeds the threshold.
    RemoveContaminated(ContaminationConfig),
    /// Clear the pairs of units farther apart than the maximum distance.
    UnitPositions(PositionsConfig),
    /// Clear the pairs whose cross-correlogram differs from their auto-correlograms.
    Correlogram(CorrelogramConfig),
    /// Clear the pairs whose templates differ.
    TemplateSimilarity(TemplateConfig),
    /// Clear the pairs whose presence over the recording is too similar.
    PresenceDistance(PresenceConfig),
    /// Clear the pairs whose spikes are not nearest neighbours in feature space.
    Knn(KnnConfig),
    /// Clear the pairs whose cross-contamination is significant.
    CrossContamination(CrossContaminationConfig),
    /// Clear the pairs whose merge would decrease the quality score.
    QualityScore(QualityConfig),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::MinSpikes(_) => StageKind::MinSpikes,
            Stage::RemoveContaminated(_) => StageKind::RemoveContaminated,
            Stage::UnitPositions(_) => StageKind::UnitPositions,
            Stage::Correlogram(_) => StageKind::Correlogram,
            Stage::TemplateSimilarity(_) => StageKind::TemplateSimilarity,
            Stage::PresenceDistance(_) => StageKind::PresenceDistance,
            Stage::Knn(_) => StageKind::Knn,
            Stage::CrossContamination(_) => StageKind::CrossContamination,
            Stage::QualityScore(_) => StageKind::QualityScore,
        }
    }

    /// Check the stage configuration and that the analyzer provides everything the stage needs.
    pub fn check<A: Analyzer + ?Sized>(&self, analyzer: &A) -> Result<(), MergeError> {
        match self {
            Stage::MinSpikes(_) => Ok(()),
            Stage::RemoveContaminated(config) => {
                config.window.validate()?;
                if config.contamination_threshold.is_nan() {
                    return Err(MergeError::InvalidParameter(
                        "contamination_threshold must be a number".to_string(),
                    ));
                }
                Ok(())
            }
            Stage::UnitPositions(config) => {
                if config.maximum_distance_um.is_nan() || config.maximum_distance_um < 0.0 {
                    return Err(MergeError::InvalidParameter(format!(
                        "maximum_distance_um must be non-negative, got {}",
                        config.maximum_distance_um
                    )));
                }
                let from_templates = analyzer.templates().is_some() && analyzer.channel_locations().is_some();
                if analyzer.unit_locations().is_none() && !from_templates {
                    return Err(MergeError::MissingExtension(
                        "unit_locations (or templates with channel locations)".to_string(),
                    ));
                }
                Ok(())
            }
            Stage::Correlogram(config) => {
                check_positive("sigma_smooth_ms", config.sigma_smooth_ms)?;
                check_positive("adaptive_window_ratio", config.adaptive_window_ratio)?;
                if config.censor_correlograms_ms.is_nan() {
                    return Err(MergeError::InvalidParameter(
                        "censor_correlograms_ms must be a number".to_string(),
                    ));
                }
                CorrelogramBinning::build(analyzer.sampling_frequency(), config.window_ms, config.bin_ms)?;
                Ok(())
            }
            Stage::TemplateSimilarity(config) => {
                if config.num_channels == Some(0) {
                    return Err(MergeError::InvalidParameter(
                        "num_channels must be at least 1".to_string(),
                    ));
                }
                if analyzer.template_similarity().is_none() && analyzer.templates().is_none() {
                    return Err(MergeError::MissingExtension("templates".to_string()));
                }
                Ok(())
            }
            Stage::PresenceDistance(config) => check_positive("presence_bin_duration_s", config.bin_duration_s),
            Stage::Knn(config) => {
                if config.k_nn == 0 {
                    return Err(MergeError::InvalidParameter("k_nn must be at least 1".to_string()));
                }
                if analyzer.spike_features().is_none() {
                    return Err(MergeError::MissingExtension("spike_features".to_string()));
                }
                Ok(())
            }
            Stage::CrossContamination(config) => {
                config.window.validate()?;
                check_unit_interval("cc_threshold", config.cc_threshold)?;
                check_unit_interval("p_value", config.p_value)
            }
            Stage::QualityScore(config) => {
                config.window.validate()?;
                if config.firing_contamination_balance.is_nan() {
                    return Err(MergeError::InvalidParameter(
                        "firing_contamination_balance must be a number".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// All the parameters of the pipeline, with the stage sequence given either as names or as a preset.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoMergeParams {
    pub minimum_spikes: usize,
    pub maximum_distance_um: f64,
    pub peak_sign: PeakSign,
    pub bin_ms: f64,
    pub window_ms: f64,
    pub corr_diff_thresh: f64,
    pub template_diff_thresh: f64,
    pub censored_period_ms: f64,
    pub refractory_period_ms: f64,
    pub sigma_smooth_ms: f64,
    pub contamination_threshold: f64,
    pub adaptive_window_ratio: f64,
    pub censor_correlograms_ms: f64,
    pub num_channels: Option<usize>,
    pub num_shift: usize,
    pub firing_contamination_balance: f64,
    pub presence_distance_thresh: f64,
    pub presence_bin_duration_s: f64,
    pub template_metric: TemplateMetric,
    pub p_value: f64,
    pub cc_threshold: f64,
    pub k_nn: usize,
    pub knn_algorithm: NeighborAlgorithm,
    pub max_validated_pairs: Option<usize>,
    /// Stage names, taking precedence over the preset.
    pub steps: Option<Vec<String>>,
    pub preset: Option<String>,
    pub extra_outputs: bool,
}

impl Default for AutoMergeParams {
    fn default() -> Self {
        AutoMergeParams {
            minimum_spikes: 100,
            maximum_distance_um: 150.0,
            peak_sign: PeakSign::Neg,
            bin_ms: 0.25,
            window_ms: 100.0,
            corr_diff_thresh: 0.16,
            template_diff_thresh: 0.25,
            censored_period_ms: 0.3,
            refractory_period_ms: 1.0,
            sigma_smooth_ms: 0.6,
            contamination_threshold: 0.2,
            adaptive_window_ratio: 0.5,
            censor_correlograms_ms: 0.15,
            num_channels: Some(5),
            num_shift: 5,
            firing_contamination_balance: 2.5,
            presence_distance_thresh: 100.0,
            presence_bin_duration_s: 2.0,
            template_metric: TemplateMetric::L1,
            p_value: 0.2,
            cc_threshold: 0.1,
            k_nn: 5,
            knn_algorithm: NeighborAlgorithm::KdTree,
            max_validated_pairs: None,
            steps: None,
            preset: None,
            extra_outputs: false,
        }
    }
}

impl AutoMergeParams {
    fn refractory_window(&self) -> RefractoryWindow {
        RefractoryWindow {
            censored_period_ms: self.censored_period_ms,
            refractory_period_ms: self.refractory_period_ms,
        }
    }

    /// Returns the stage of the given kind, configured from the parameters.
    pub fn stage(&self, kind: StageKind) -> Stage {
        let window = self.refractory_window();
        match kind {
            StageKind::MinSpikes => Stage::MinSpikes(MinSpikesConfig {
                minimum_spikes: self.minimum_spikes,
            }),
            StageKind::RemoveContaminated => Stage::RemoveContaminated(ContaminationConfig {
                contamination_threshold: self.contamination_threshold,
                window,
            }),
            StageKind::UnitPositions => Stage::UnitPositions(PositionsConfig {
                maximum_distance_um: self.maximum_distance_um,
                peak_sign: self.peak_sign,
            }),
            StageKind::Correlogram => Stage::Correlogram(CorrelogramConfig {
                window_ms: self.window_ms,
                bin_ms: self.bin_ms,
                censor_correlograms_ms: self.censor_correlograms_ms,
                sigma_smooth_ms: self.sigma_smooth_ms,
                adaptive_window_ratio: self.adaptive_window_ratio,
                corr_diff_thresh: self.corr_diff_thresh,
            }),
            StageKind::TemplateSimilarity => Stage::TemplateSimilarity(TemplateConfig {
                num_channels: self.num_channels,
                num_shift: self.num_shift,
                metric: self.template_metric,
                template_diff_thresh: self.template_diff_thresh,
            }),
            StageKind::PresenceDistance => Stage::PresenceDistance(PresenceConfig {
                bin_duration_s: self.presence_bin_duration_s,
                presence_distance_thresh: self.presence_distance_thresh,
            }),
            StageKind::Knn => Stage::Knn(KnnConfig {
                k_nn: self.k_nn,
                algorithm: self.knn_algorithm,
            }),
            StageKind::CrossContamination => Stage::CrossContamination(CrossContaminationConfig {
                window,
                cc_threshold: self.cc_threshold,
                p_value: self.p_value,
            }),
            StageKind::QualityScore => Stage::QualityScore(QualityConfig {
                window,
                firing_contamination_balance: self.firing_contamination_balance,
                max_validated_pairs: self.max_validated_pairs,
            }),
        }
    }

    /// Returns the stage sequence: the named steps if any, else the preset, else the default preset.
    pub fn stages(&self) -> Result<Vec<Stage>, MergeError> {
        let kinds = match (&self.steps, &self.preset) {
            (Some(steps), _) => steps
                .iter()
                .map(|step| StageKind::from_str(step))
                .collect::<Result<Vec<StageKind>, MergeError>>()?,
            (None, Some(preset)) => Preset::from_str(preset)?.stage_kinds(),
            (None, None) => Preset::Default.stage_kinds(),
        };
        Ok(kinds.into_iter().map(|kind| self.stage(kind)).collect())
    }

    /// Save the parameters to a file in JSON format.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), MergeError> {
        let file = File::create(path).map_err(|e| MergeError::IOError(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|e| MergeError::IOError(e.to_string()))?;
        writer.flush().map_err(|e| MergeError::IOError(e.to_string()))
    }

    /// Load the parameters from a JSON file. Missing fields take their default value.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, MergeError> {
        let file = File::open(path).map_err(|e| MergeError::IOError(e.to_string()))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| MergeError::IOError(e.to_string()))
    }
}

/// The number of candidate pairs before and after a stage.
#[derive(Debug, PartialEq, Clone, Copy, Serialize)]
pub struct StageReport {
    pub stage: StageKind,
    pub candidates_before: usize,
    pub candidates_after: usize,
}

/// The intermediate results of the stages which ran. Pairs are given by unit index, except for the
/// rejected pairs which are given by unit id.
#[derive(Debug, PartialEq, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub stages: Vec<StageReport>,
    pub num_spikes: Option<Vec<usize>>,
    pub contaminations: Option<Vec<f64>>,
    pub unit_distances: Option<DMatrix<f64>>,
    pub correlograms: Option<Correlograms>,
    pub correlograms_smoothed: Option<Correlograms>,
    pub win_sizes: Option<Vec<usize>>,
    pub correlogram_diff: Option<DMatrix<f64>>,
    pub templates_diff: Option<DMatrix<f64>>,
    pub presence_distances: Option<DMatrix<f64>>,
    pub neighbor_units: Option<Vec<BTreeSet<usize>>>,
    pub cross_contaminations: Option<DMatrix<f64>>,
    pub cross_contamination_p_values: Option<DMatrix<f64>>,
    pub merged_scores: Option<DMatrix<f64>>,
    pub pairs_decreased_score: Option<Vec<(String, String)>>,
    pub pairs_not_validated: Option<Vec<(String, String)>>,
}

impl Diagnostics {
    /// Save the diagnostics to a file in JSON format. Scores which were not computed are written as null.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), MergeError> {
        let file = File::create(path).map_err(|e| MergeError::IOError(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|e| MergeError::IOError(e.to_string()))?;
        writer.flush().map_err(|e| MergeError::IOError(e.to_string()))
    }
}

/// The merges proposed by the pipeline.
#[derive(Debug, PartialEq, Clone)]
pub struct MergeProposal {
    pub pairs: Vec<(String, String)>,
    /// Only recorded on request.
    pub diagnostics: Option<Diagnostics>,
}

/// The state carried through the stages: the candidate matrix and the diagnostics.
pub struct Pipeline<'a, A: Analyzer + ?Sized> {
    analyzer: &'a A,
    candidates: CandidateMatrix,
    diagnostics: Diagnostics,
}

impl<'a, A: Analyzer + ?Sized> Pipeline<'a, A> {
    pub fn new(analyzer: &'a A) -> Self {
        Pipeline {
            analyzer,
            candidates: CandidateMatrix::new(analyzer.num_units()),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn candidates(&self) -> &CandidateMatrix {
        &self.candidates
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    fn index_pairs_to_ids(&self, pairs: &[(usize, usize)]) -> Vec<(String, String)> {
        let unit_ids = self.analyzer.unit_ids();
        pairs
            .iter()
            .map(|&(i, j)| (unit_ids[i].clone(), unit_ids[j].clone()))
            .collect()
    }

    /// Run one stage on the current candidates.
    pub fn run_stage(&mut self, stage: &Stage) -> Result<(), MergeError> {
        let candidates_before = self.candidates.count();
        match stage {
            Stage::MinSpikes(config) => self.remove_small_units(config),
            Stage::RemoveContaminated(config) => self.remove_contaminated_units(config),
            Stage::UnitPositions(config) => self.restrict_to_close_units(config)?,
            Stage::Correlogram(config) => self.compare_correlograms(config)?,
            Stage::TemplateSimilarity(config) => self.compare_templates(config)?,
            Stage::PresenceDistance(config) => self.compare_presence(config),
            Stage::Knn(config) => self.restrict_to_neighbor_units(config)?,
            Stage::CrossContamination(config) => self.check_cross_contamination(config),
            Stage::QualityScore(config) => self.check_quality_score(config),
        }
        let candidates_after = self.candidates.count();

        log::info!(
            "{}: {} -> {} candidate pairs",
            stage.kind(),
            candidates_before,
            candidates_after
        );
        self.diagnostics.stages.push(StageReport {
            stage: stage.kind(),
            candidates_before,
            candidates_after,
        });
        Ok(())
    }

    fn remove_small_units(&mut self, config: &MinSpikesConfig) {
        let num_spikes = self.analyzer.num_spikes();
        for (unit_index, &n) in num_spikes.iter().enumerate() {
            if n < config.minimum_spikes {
                self.candidates.clear_unit(unit_index);
            }
        }
        self.diagnostics.num_spikes = Some(num_spikes);
    }

    fn remove_contaminated_units(&mut self, config: &ContaminationConfig) {
        let contaminations = self.analyzer.contaminations(&config.window);
        for (unit_index, &c) in contaminations.iter().enumerate() {
            if c > config.contamination_threshold {
                self.candidates.clear_unit(unit_index);
            }
        }
        self.diagnostics.contaminations = Some(contaminations);
    }

    fn restrict_to_close_units(&mut self, config: &PositionsConfig) -> Result<(), MergeError> {
        let locations = match self.analyzer.unit_locations() {
            Some(locations) => locations.to_vec(),
            None => {
                let templates = self
                    .analyzer
                    .templates()
                    .ok_or_else(|| MergeError::MissingExtension("templates".to_string()))?;
                let channel_locations = self
                    .analyzer
                    .channel_locations()
                    .ok_or_else(|| MergeError::MissingExtension("channel_locations".to_string()))?;
                log::debug!("Unit locations estimated from the template extremum channels");
                locations_from_templates(templates, channel_locations, config.peak_sign)?
            }
        };
        let distances = distance_matrix(&locations);
        self.candidates
            .retain(|i, j| distances[(i, j)] <= config.maximum_distance_um);
        self.diagnostics.unit_distances = Some(distances);
        Ok(())
    }

    fn compare_correlograms(&mut self, config: &CorrelogramConfig) -> Result<(), MergeError> {
        let mut correlograms = (*self.analyzer.correlograms(config.window_ms, config.bin_ms)?).clone();
        censor_correlograms(&mut correlograms, config.censor_correlograms_ms);
        let smoothed = smooth_correlograms(&correlograms, config.sigma_smooth_ms);

        let win_sizes: Vec<usize> = smoothed
            .autos()
            .iter()
            .map(|auto_corr| {
                let max = auto_corr.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                get_unit_adaptive_window(auto_corr, max * config.adaptive_window_ratio)
            })
            .collect();
        log::debug!("Adaptive correlogram windows (in bins): {:?}", win_sizes);

        let num_spikes = self.analyzer.num_spikes();
        let diff = compute_correlogram_diff(&smoothed, &win_sizes, &num_spikes, &self.candidates);
        self.candidates
            .retain_scores(&diff, |d| d < config.corr_diff_thresh);

        self.diagnostics.correlograms = Some(correlograms);
        self.diagnostics.correlograms_smoothed = Some(smoothed);
        self.diagnostics.win_sizes = Some(win_sizes);
        self.diagnostics.correlogram_diff = Some(diff);
        Ok(())
    }

    fn compare_templates(&mut self, config: &TemplateConfig) -> Result<(), MergeError> {
        let diff = match (self.analyzer.template_similarity(), self.analyzer.templates()) {
            (Some(similarity), _) => {
                log::debug!("Template differences from the precomputed template similarity");
                self.candidates.map_pairs(|i, j| 1.0 - similarity[(i, j)])
            }
            (None, Some(templates)) => compute_templates_diff(
                templates,
                self.analyzer.sparsity(),
                &self.candidates,
                config.num_channels,
                config.num_shift,
                config.metric,
            ),
            (None, None) => return Err(MergeError::MissingExtension("templates".to_string())),
        };
        self.candidates
            .retain_scores(&diff, |d| d < config.template_diff_thresh);
        self.diagnostics.templates_diff = Some(diff);
        Ok(())
    }

    fn compare_presence(&mut self, config: &PresenceConfig) {
        let distances = compute_presence_distance(
            &self.analyzer.spike_trains(),
            self.analyzer.sampling_frequency(),
            self.analyzer.num_samples(),
            config.bin_duration_s,
            &self.candidates,
        );
        self.candidates
            .retain_scores(&distances, |d| d > config.presence_distance_thresh);
        self.diagnostics.presence_distances = Some(distances);
    }

    fn restrict_to_neighbor_units(&mut self, config: &KnnConfig) -> Result<(), MergeError> {
        let spike_features = self
            .analyzer
            .spike_features()
            .ok_or_else(|| MergeError::MissingExtension("spike_features".to_string()))?;
        let unit_features: Vec<&[Feature]> = spike_features.iter().map(|f| f.as_slice()).collect();
        let neighbors = neighbor_units(&unit_features, config.k_nn, config.algorithm);
        restrict_to_neighbors(&mut self.candidates, &neighbors);
        self.diagnostics.neighbor_units = Some(neighbors);
        Ok(())
    }

    fn check_cross_contamination(&mut self, config: &CrossContaminationConfig) {
        let analyzer = self.analyzer;
        let results = self.candidates.evaluate_pairs(|i, j| {
            cross_contamination(
                analyzer.spike_train(i),
                analyzer.spike_train(j),
                analyzer.sampling_frequency(),
                analyzer.num_samples(),
                &config.window,
                config.cc_threshold,
            )
        });

        let num_units = self.candidates.num_units();
        let mut estimates = DMatrix::from_element(num_units, num_units, f64::NAN);
        let mut p_values = DMatrix::from_element(num_units, num_units, f64::NAN);
        for ((i, j), cc) in results {
            estimates[(i, j)] = cc.estimate;
            p_values[(i, j)] = cc.p_value;
        }
        self.candidates
            .retain_scores(&p_values, |p| p > config.p_value);

        self.diagnostics.cross_contaminations = Some(estimates);
        self.diagnostics.cross_contamination_p_values = Some(p_values);
    }

    fn check_quality_score(&mut self, config: &QualityConfig) {
        let contaminations = self.analyzer.contaminations(&config.window);
        let (validation, merged_scores) = check_improve_contaminations_score(
            self.analyzer,
            &mut self.candidates,
            &contaminations,
            config.firing_contamination_balance,
            &config.window,
            config.max_validated_pairs,
        );
        self.diagnostics.pairs_decreased_score =
            Some(self.index_pairs_to_ids(&validation.pairs_decreased_score));
        self.diagnostics.pairs_not_validated = Some(self.index_pairs_to_ids(&validation.pairs_not_validated));
        self.diagnostics.merged_scores = Some(merged_scores);
    }

    /// Returns the surviving candidate pairs as unit ids.
    pub fn finalize(self) -> (Vec<(String, String)>, Diagnostics) {
        let pairs = self.index_pairs_to_ids(&self.candidates.pairs());
        (pairs, self.diagnostics)
    }
}

/// Check every stage, then run them in order. Returns the surviving pairs and the diagnostics.
pub fn run_stages<A: Analyzer + ?Sized>(
    analyzer: &A,
    stages: &[Stage],
) -> Result<(Vec<(String, String)>, Diagnostics), MergeError> {
    for stage in stages.iter() {
        stage.check(analyzer)?;
    }

    log::info!(
        "Looking for merges among {} units in {} stages",
        analyzer.num_units(),
        stages.len()
    );
    let mut pipeline = Pipeline::new(analyzer);
    for stage in stages.iter() {
        pipeline.run_stage(stage)?;
    }
    let (pairs, diagnostics) = pipeline.finalize();
    log::info!("{} potential merges found", pairs.len());

    Ok((pairs, diagnostics))
}

/// Find the pairs of units which should potentially be merged.
/// The diagnostics are only returned if `params.extra_outputs` is set.
pub fn get_potential_auto_merge<A: Analyzer + ?Sized>(
    analyzer: &A,
    params: &AutoMergeParams,
) -> Result<MergeProposal, MergeError> {
    let stages = params.stages()?;
    let (pairs, diagnostics) = run_stages(analyzer, &stages)?;
    Ok(MergeProposal {
        pairs,
        diagnostics: if params.extra_outputs {
            Some(diagnostics)
        } else {
            None
        },
    })
}
