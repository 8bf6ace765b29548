//! This crate proposes merges between the units of a spike-sorted neural recording.
//!
//! A spike sorter often splits a neuron into several units, e.g., when its waveform drifts or when its
//! spikes are detected on different channels. The merge pipeline looks for such pairs of units by combining
//! several criteria: spike counts, refractory period violations, unit locations, correlograms, templates,
//! presence over time, cross-contamination and, finally, whether the merged unit would have a better quality
//! score than both original units.
//!
//! # Loading a Recording
//!
//! ```rust
//! use unit_merge::analyzer::{Analyzer, MemoryAnalyzer, Recording, UnitRecord};
//! use unit_merge::spike_train::SpikeTrain;
//!
//! let recording = Recording::new(
//!     30_000.0,
//!     300_000,
//!     vec![
//!         UnitRecord::new("a", SpikeTrain::build(&[100, 5_000, 12_000])).with_location([0.0, 0.0]),
//!         UnitRecord::new("b", SpikeTrain::build(&[900, 7_000])).with_location([0.0, 20.0]),
//!     ],
//! );
//! let analyzer = MemoryAnalyzer::from_recording(recording).unwrap();
//!
//! assert_eq!(analyzer.num_units(), 2);
//! assert_eq!(analyzer.num_spikes(), vec![3, 2]);
//! ```
//!
//! # Finding Merges
//!
//! ```rust
//! use unit_merge::analyzer::{MemoryAnalyzer, Recording, UnitRecord};
//! use unit_merge::pipeline::{get_potential_auto_merge, AutoMergeParams};
//! use unit_merge::spike_train::SpikeTrain;
//!
//! let recording = Recording::new(
//!     30_000.0,
//!     300_000,
//!     vec![
//!         UnitRecord::new("a", SpikeTrain::build(&[100, 5_000, 12_000])).with_location([0.0, 0.0]),
//!         UnitRecord::new("b", SpikeTrain::build(&[900, 7_000])).with_location([0.0, 20.0]),
//!         UnitRecord::new("c", SpikeTrain::build(&[2_000, 9_000])).with_location([0.0, 500.0]),
//!     ],
//! );
//! let analyzer = MemoryAnalyzer::from_recording(recording).unwrap();
//!
//! // Only keep the pairs of units closer than 150 um
//! let params = AutoMergeParams {
//!     steps: Some(vec!["unit_positions".to_string()]),
//!     ..AutoMergeParams::default()
//! };
//! let proposal = get_potential_auto_merge(&analyzer, &params).unwrap();
//!
//! assert_eq!(proposal.pairs, vec![("a".to_string(), "b".to_string())]);
//! ```
//!
//! # Grouping Merges
//!
//! ```rust
//! use unit_merge::merge_graph::resolve_merge_groups;
//!
//! let unit_ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
//! let pairs = vec![
//!     ("a".to_string(), "b".to_string()),
//!     ("b".to_string(), "d".to_string()),
//! ];
//!
//! let groups = resolve_merge_groups(&unit_ids, &pairs).unwrap();
//! assert_eq!(groups, vec![vec!["a".to_string(), "b".to_string(), "d".to_string()]]);
//! ```

pub mod analyzer;
pub mod candidates;
pub mod contamination;
pub mod correlogram;
pub mod error;
pub mod knn;
pub mod location;
pub mod merge_graph;
pub mod pipeline;
pub mod presence;
pub mod quality;
pub mod spike_train;
pub mod template;

/// The minimum number of independent items (pairs, spikes, units) for a computation to be parallelized.
pub const MIN_PAIRS_PAR: usize = 64;
