use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use unit_merge::analyzer::{MemoryAnalyzer, Recording, UnitRecord};
use unit_merge::error::MergeError;
use unit_merge::knn::Feature;
use unit_merge::merge_graph::resolve_merge_groups;
use unit_merge::pipeline::{get_potential_auto_merge, run_stages, AutoMergeParams, StageKind};
use unit_merge::spike_train::SpikeTrain;
use unit_merge::template::Template;

const SEED: u64 = 42;
const FS: f64 = 30_000.0;
const NUM_SAMPLES: u64 = 30_000 * 600;
const DEAD_TIME: i64 = 60;

const CHANNEL_LOCATIONS: [[f64; 2]; 4] = [[0.0, 0.0], [0.0, 20.0], [0.0, 40.0], [0.0, 300.0]];

/// A negative spike-like waveform, weighted per channel.
fn template(weights: [f64; 4]) -> Template {
    Template::new(DMatrix::from_fn(30, 4, |s, c| {
        let dt = s as f64 - 15.0;
        -weights[c] * (-dt * dt / 4.0).exp()
    }))
}

fn spike_features(spike_train: &SpikeTrain, center: Feature, rng: &mut ChaCha8Rng) -> Vec<Feature> {
    (0..spike_train.num_spikes())
        .map(|_| [
            center[0] + rng.gen_range(-0.1..0.1),
            center[1] + rng.gen_range(-5.0..5.0),
            center[2] + rng.gen_range(-5.0..5.0),
        ])
        .collect()
}

fn split_randomly(spike_train: &SpikeTrain, rng: &mut ChaCha8Rng) -> (SpikeTrain, SpikeTrain) {
    let (first, second): (Vec<i64>, Vec<i64>) =
        spike_train.samples().iter().partition(|_| rng.gen_bool(0.5));
    (SpikeTrain::build(&first), SpikeTrain::build(&second))
}

/// Units a and b are the two halves of a randomly split neuron, unit c is an unrelated neuron
/// with a 10 times larger template on a distant channel.
fn split_neuron_recording() -> Recording {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let neuron = SpikeTrain::rand_poisson(50.0, DEAD_TIME, FS, NUM_SAMPLES, &mut rng).unwrap();
    let (half_a, half_b) = split_randomly(&neuron, &mut rng);
    let other = SpikeTrain::rand_poisson(20.0, DEAD_TIME, FS, NUM_SAMPLES, &mut rng).unwrap();

    let features_a = spike_features(&half_a, [-1.0, 0.0, 0.0], &mut rng);
    let features_b = spike_features(&half_b, [-1.0, 0.0, 0.0], &mut rng);
    let features_c = spike_features(&other, [-10.0, 0.0, 300.0], &mut rng);

    Recording::new(
        FS,
        NUM_SAMPLES,
        vec![
            UnitRecord::new("a", half_a)
                .with_template(template([1.0, 0.5, 0.2, 0.0]))
                .with_spike_features(features_a),
            UnitRecord::new("b", half_b)
                .with_template(template([1.0, 0.5, 0.2, 0.0]))
                .with_spike_features(features_b),
            UnitRecord::new("c", other)
                .with_template(template([0.0, 0.0, 0.5, 10.0]))
                .with_spike_features(features_c),
        ],
    )
    .with_channel_locations(CHANNEL_LOCATIONS.to_vec())
}

fn analyzer(recording: Recording) -> MemoryAnalyzer {
    MemoryAnalyzer::from_recording(recording).unwrap()
}

fn pair(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

fn steps(names: &[&str]) -> Option<Vec<String>> {
    Some(names.iter().map(|name| name.to_string()).collect())
}

#[test]
fn test_split_neuron_is_merged() {
    let analyzer = analyzer(split_neuron_recording());
    let params = AutoMergeParams {
        extra_outputs: true,
        ..AutoMergeParams::default()
    };
    let proposal = get_potential_auto_merge(&analyzer, &params).unwrap();
    assert_eq!(proposal.pairs, vec![pair("a", "b")]);

    let diagnostics = proposal.diagnostics.unwrap();
    let distances = diagnostics.unit_distances.unwrap();
    assert_eq!(distances[(0, 1)], 0.0);
    assert_eq!(distances[(0, 2)], 300.0);
    assert!(diagnostics.templates_diff.unwrap()[(0, 1)] < 1e-9);
    assert!(diagnostics.correlogram_diff.unwrap()[(0, 1)] < 0.16);
    assert_eq!(diagnostics.win_sizes.unwrap().len(), 3);
    assert_eq!(diagnostics.pairs_decreased_score, Some(vec![]));
}

#[test]
fn test_split_neuron_with_other_presets() {
    let analyzer = analyzer(split_neuron_recording());

    for preset in ["lussac", "knn"] {
        let params = AutoMergeParams {
            preset: Some(preset.to_string()),
            ..AutoMergeParams::default()
        };
        let proposal = get_potential_auto_merge(&analyzer, &params).unwrap();
        assert_eq!(proposal.pairs, vec![pair("a", "b")], "preset {}", preset);
    }

    // Both halves are present throughout the recording, which is not a temporal split
    let params = AutoMergeParams {
        preset: Some("temporal_splits".to_string()),
        ..AutoMergeParams::default()
    };
    assert!(get_potential_auto_merge(&analyzer, &params).unwrap().pairs.is_empty());
}

#[test]
fn test_temporal_split_is_merged() {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let neuron = SpikeTrain::rand_poisson(30.0, DEAD_TIME, FS, NUM_SAMPLES, &mut rng).unwrap();
    let (first, second): (Vec<i64>, Vec<i64>) = neuron
        .samples()
        .iter()
        .partition(|&&t| t < NUM_SAMPLES as i64 / 2);

    let recording = Recording::new(
        FS,
        NUM_SAMPLES,
        vec![
            UnitRecord::new("early", SpikeTrain::build(&first)).with_template(template([1.0, 0.5, 0.2, 0.0])),
            UnitRecord::new("late", SpikeTrain::build(&second)).with_template(template([1.0, 0.5, 0.2, 0.0])),
        ],
    )
    .with_channel_locations(CHANNEL_LOCATIONS.to_vec());
    let analyzer = analyzer(recording);

    let params = AutoMergeParams {
        steps: steps(&[
            "min_spikes",
            "remove_contaminated",
            "unit_positions",
            "template_similarity",
            "presence_distance",
            "check_increase_score",
        ]),
        extra_outputs: true,
        ..AutoMergeParams::default()
    };
    let proposal = get_potential_auto_merge(&analyzer, &params).unwrap();
    assert_eq!(proposal.pairs, vec![pair("early", "late")]);
    // The two halves are about 300 s apart
    let distances = proposal.diagnostics.unwrap().presence_distances.unwrap();
    assert!((distances[(0, 1)] - 300.0).abs() < 10.0);
}

#[test]
fn test_contaminating_merge_is_rejected() {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let neuron = SpikeTrain::rand_poisson(20.0, DEAD_TIME, FS, NUM_SAMPLES - 100, &mut rng).unwrap();
    // The same spikes 0.5 ms later: after the censored period but within the refractory period
    let echo: Vec<i64> = neuron.samples().iter().map(|t| t + 15).collect();

    let recording = Recording::new(
        FS,
        NUM_SAMPLES,
        vec![
            UnitRecord::new("a", neuron).with_template(template([1.0, 0.5, 0.2, 0.0])),
            UnitRecord::new("b", SpikeTrain::build(&echo)).with_template(template([1.0, 0.5, 0.2, 0.0])),
        ],
    )
    .with_channel_locations(CHANNEL_LOCATIONS.to_vec());
    let analyzer = analyzer(recording);

    let earlier_stages = ["min_spikes", "remove_contaminated", "unit_positions", "template_similarity"];
    let params = AutoMergeParams {
        steps: steps(&earlier_stages),
        ..AutoMergeParams::default()
    };
    assert_eq!(
        get_potential_auto_merge(&analyzer, &params).unwrap().pairs,
        vec![pair("a", "b")]
    );

    let mut all_stages = earlier_stages.to_vec();
    all_stages.push("check_increase_score");
    let params = AutoMergeParams {
        steps: steps(&all_stages),
        extra_outputs: true,
        ..AutoMergeParams::default()
    };
    let proposal = get_potential_auto_merge(&analyzer, &params).unwrap();
    assert!(proposal.pairs.is_empty());

    let diagnostics = proposal.diagnostics.unwrap();
    assert_eq!(diagnostics.pairs_decreased_score, Some(vec![pair("a", "b")]));
    assert!(diagnostics.merged_scores.unwrap()[(0, 1)] < 0.0);
}

#[test]
fn test_determinism() {
    let params = AutoMergeParams {
        extra_outputs: true,
        ..AutoMergeParams::default()
    };
    let first = get_potential_auto_merge(&analyzer(split_neuron_recording()), &params).unwrap();
    let second = get_potential_auto_merge(&analyzer(split_neuron_recording()), &params).unwrap();

    assert_eq!(first.pairs, second.pairs);
    // Scores which were not computed are NaN, compare their serialized form
    assert_eq!(
        serde_json::to_string(&first.diagnostics).unwrap(),
        serde_json::to_string(&second.diagnostics).unwrap()
    );
}

#[test]
fn test_candidates_only_shrink() {
    let analyzer = analyzer(split_neuron_recording());
    let params = AutoMergeParams::default();
    let stages: Vec<_> = StageKind::ALL.iter().map(|&kind| params.stage(kind)).collect();

    let (pairs, diagnostics) = run_stages(&analyzer, &stages).unwrap();
    assert_eq!(diagnostics.stages.len(), StageKind::ALL.len());
    assert_eq!(diagnostics.stages[0].candidates_before, 3);
    for report in diagnostics.stages.iter() {
        assert!(report.candidates_after <= report.candidates_before);
    }
    for reports in diagnostics.stages.windows(2) {
        assert_eq!(reports[1].candidates_before, reports[0].candidates_after);
    }
    assert_eq!(pairs.len(), diagnostics.stages.last().unwrap().candidates_after);
}

#[test]
fn test_pairs_are_not_duplicated() {
    let recording = Recording::new(
        FS,
        NUM_SAMPLES,
        (0..5)
            .map(|u| UnitRecord::new(format!("u{}", u), SpikeTrain::build(&[0, 1_000])).with_location([0.0, 0.0]))
            .collect(),
    );
    let analyzer = analyzer(recording);
    let params = AutoMergeParams {
        steps: steps(&["unit_positions"]),
        ..AutoMergeParams::default()
    };
    let pairs = get_potential_auto_merge(&analyzer, &params).unwrap().pairs;
    assert_eq!(pairs.len(), 10);
    for (a, b) in pairs.iter() {
        assert_ne!(a, b);
        assert!(!pairs.contains(&(b.clone(), a.clone())));
    }

    let groups = resolve_merge_groups(&["u0", "u1", "u2", "u3", "u4"].map(String::from), &pairs).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 5);
}

#[test]
fn test_precomputed_template_similarity() {
    let units = ["a", "b", "c"]
        .iter()
        .map(|id| UnitRecord::new(*id, SpikeTrain::build(&[0, 1_000])))
        .collect();
    let recording = Recording {
        template_similarity: Some(vec![
            vec![1.0, 0.9, 0.5],
            vec![0.9, 1.0, 0.6],
            vec![0.5, 0.6, 1.0],
        ]),
        ..Recording::new(FS, NUM_SAMPLES, units)
    };
    let params = AutoMergeParams {
        steps: steps(&["template_similarity"]),
        extra_outputs: true,
        ..AutoMergeParams::default()
    };
    let proposal = get_potential_auto_merge(&analyzer(recording), &params).unwrap();
    assert_eq!(proposal.pairs, vec![pair("a", "b")]);

    let templates_diff = proposal.diagnostics.unwrap().templates_diff.unwrap();
    assert!((templates_diff[(0, 1)] - 0.1).abs() < 1e-12);
    assert!((templates_diff[(0, 2)] - 0.5).abs() < 1e-12);
    assert!((templates_diff[(1, 2)] - 0.4).abs() < 1e-12);
}

#[test]
fn test_sparse_templates_without_common_channel() {
    let recording = Recording::new(
        FS,
        NUM_SAMPLES,
        vec![
            UnitRecord::new("a", SpikeTrain::build(&[0, 1_000]))
                .with_template(template([1.0, 0.5, 0.2, 0.0]))
                .with_sparsity(vec![true, true, false, false]),
            UnitRecord::new("b", SpikeTrain::build(&[0, 1_000]))
                .with_template(template([0.0, 0.0, 0.5, 10.0]))
                .with_sparsity(vec![false, false, true, true]),
            UnitRecord::new("c", SpikeTrain::build(&[0, 1_000]))
                .with_template(template([1.0, 0.5, 0.2, 0.0]))
                .with_sparsity(vec![true, true, true, false]),
        ],
    );
    let params = AutoMergeParams {
        steps: steps(&["template_similarity"]),
        num_channels: None,
        extra_outputs: true,
        ..AutoMergeParams::default()
    };
    let proposal = get_potential_auto_merge(&analyzer(recording), &params).unwrap();
    assert_eq!(proposal.pairs, vec![pair("a", "c")]);

    let templates_diff = proposal.diagnostics.unwrap().templates_diff.unwrap();
    assert_eq!(templates_diff[(0, 1)], 1.0);
    assert!(templates_diff[(0, 2)] < 1e-9);
}

#[test]
fn test_configuration_errors() {
    let analyzer = analyzer(split_neuron_recording());

    let params = AutoMergeParams {
        steps: steps(&["min_spikes", "bogus"]),
        ..AutoMergeParams::default()
    };
    assert_eq!(
        get_potential_auto_merge(&analyzer, &params),
        Err(MergeError::UnknownStage("bogus".to_string()))
    );

    let params = AutoMergeParams {
        preset: Some("everything".to_string()),
        ..AutoMergeParams::default()
    };
    assert_eq!(
        get_potential_auto_merge(&analyzer, &params),
        Err(MergeError::UnknownPreset("everything".to_string()))
    );

    // Without templates, unit locations cannot be estimated
    let bare = Recording::new(
        FS,
        NUM_SAMPLES,
        vec![
            UnitRecord::new("a", SpikeTrain::build(&[0, 1_000])),
            UnitRecord::new("b", SpikeTrain::build(&[500])),
        ],
    );
    assert!(matches!(
        get_potential_auto_merge(&MemoryAnalyzer::from_recording(bare).unwrap(), &AutoMergeParams::default()),
        Err(MergeError::MissingExtension(_))
    ));
}

#[test]
fn test_json_round_trips() {
    let dir = tempdir().unwrap();

    let params = AutoMergeParams {
        minimum_spikes: 50,
        num_channels: None,
        preset: Some("lussac".to_string()),
        ..AutoMergeParams::default()
    };
    let params_path = dir.path().join("params.json");
    params.save_to(&params_path).unwrap();
    assert_eq!(AutoMergeParams::load_from(&params_path).unwrap(), params);

    let recording = split_neuron_recording();
    let recording_path = dir.path().join("recording.json");
    recording.save_to(&recording_path).unwrap();
    let loaded = Recording::load_from(&recording_path).unwrap();
    assert_eq!(loaded.units.len(), 3);
    for (unit, original) in loaded.units.iter().zip(recording.units.iter()) {
        assert_eq!(unit.id, original.id);
        assert_eq!(unit.spike_train, original.spike_train);
    }

    let loaded = MemoryAnalyzer::load_from(&recording_path).unwrap();
    let proposal = get_potential_auto_merge(&loaded, &params).unwrap();
    assert_eq!(proposal.pairs, vec![pair("a", "b")]);

    assert!(matches!(
        AutoMergeParams::load_from(dir.path().join("missing.json")),
        Err(MergeError::IOError(_))
    ));
}
