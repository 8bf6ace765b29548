use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::Serialize;

use unit_merge::analyzer::{Analyzer, MemoryAnalyzer};
use unit_merge::error::MergeError;
use unit_merge::merge_graph::resolve_merge_groups;
use unit_merge::pipeline::{get_potential_auto_merge, AutoMergeParams};

#[derive(Parser, Debug)]
#[command(about = "Propose merges between the units of a spike-sorted recording")]
struct Args {
    /// The recording (JSON)
    #[arg(long)]
    recording: PathBuf,
    /// The pipeline parameters (JSON), defaults are used for missing fields
    #[arg(long)]
    params: Option<PathBuf>,
    /// The preset, must be one of: default, temporal_splits, lussac, knn
    #[arg(long)]
    preset: Option<String>,
    /// Where to write the diagnostics (JSON)
    #[arg(long)]
    diagnostics: Option<PathBuf>,
    /// Also resolve the pairs into merge groups
    #[arg(long)]
    groups: bool,
    /// The log level, must be one of: off, error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
    /// Log to this file instead of the standard error
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Serialize)]
struct Output {
    pairs: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    groups: Option<Vec<Vec<String>>>,
}

fn init_logging(args: &Args) -> Result<(), MergeError> {
    let encoder = Box::new(PatternEncoder::new("{l} - {m}\n"));
    let appender = match &args.log_file {
        Some(path) => {
            let logfile = FileAppender::builder()
                .encoder(encoder)
                .build(path)
                .map_err(|e| MergeError::IOError(e.to_string()))?;
            Appender::builder().build("log", Box::new(logfile))
        }
        None => {
            let console = ConsoleAppender::builder()
                .encoder(encoder)
                .target(log4rs::append::console::Target::Stderr)
                .build();
            Appender::builder().build("log", Box::new(console))
        }
    };

    let config = Config::builder()
        .appender(appender)
        .build(Root::builder().appender("log").build(args.log_level))
        .map_err(|e| MergeError::IOError(e.to_string()))?;

    log4rs::init_config(config).map_err(|e| MergeError::IOError(e.to_string()))?;
    Ok(())
}

fn main() -> Result<(), MergeError> {
    let args = Args::parse();
    init_logging(&args)?;
    log::info!("{:?}", args);

    let mut params = match &args.params {
        Some(path) => AutoMergeParams::load_from(path)?,
        None => AutoMergeParams::default(),
    };
    if args.preset.is_some() {
        params.preset = args.preset.clone();
        params.steps = None;
    }
    params.extra_outputs = args.diagnostics.is_some();

    let analyzer = MemoryAnalyzer::load_from(&args.recording)?;
    log::info!(
        "Recording loaded: {} units, {:.1} s at {} Hz",
        analyzer.num_units(),
        analyzer.num_samples() as f64 / analyzer.sampling_frequency(),
        analyzer.sampling_frequency()
    );

    let proposal = get_potential_auto_merge(&analyzer, &params)?;

    if let (Some(path), Some(diagnostics)) = (&args.diagnostics, &proposal.diagnostics) {
        diagnostics.save_to(path)?;
        log::info!("Diagnostics saved to {}", path.display());
    }

    let groups = if args.groups {
        Some(resolve_merge_groups(analyzer.unit_ids(), &proposal.pairs)?)
    } else {
        None
    };
    let output = Output {
        pairs: proposal.pairs,
        groups,
    };
    let json = serde_json::to_string_pretty(&output).map_err(|e| MergeError::IOError(e.to_string()))?;
    println!("{}", json);

    Ok(())
}
