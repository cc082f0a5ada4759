use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::thread;

use tracing::{info, info_span};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, prelude::*};

use rod_tracker_rust::calibration::{load_stereo_rig, load_world_transform};
use rod_tracker_rust::config::*;
use rod_tracker_rust::dataset::*;
use rod_tracker_rust::feature::ColorClass;
use rod_tracker_rust::registry::IdentityRegistry;
use rod_tracker_rust::sequence::{ColorInput, FrameOutput, SequenceController};
use rod_tracker_rust::stats::StatsCollector;
use rod_tracker_rust::synthetic::{Scene, SceneSettings};

#[derive(Parser)]
pub struct Args {
    /// Detections, one JSON object per line.
    #[clap(short, long, required_unless_present = "synthetic")]
    pub input: Option<PathBuf>,
    #[clap(long)]
    pub calibration: PathBuf,
    /// Transform from the first camera to world coordinates.
    #[clap(long)]
    pub transformation: Option<PathBuf>,
    #[clap(short, long, default_value = "./output")]
    pub output: PathBuf,
    /// Color classes to process, all colors of the input when empty.
    #[clap(long, multiple_values = true)]
    pub colors: Vec<String>,
    #[clap(long, default_value = "0")]
    pub first_frame: usize,
    /// Last frame, inclusive. Defaults to the last frame with detections.
    #[clap(long)]
    pub last_frame: Option<usize>,
    /// Folder with `rods_<color>.jsonl` of an earlier run to continue from.
    #[clap(long)]
    pub resume: Option<PathBuf>,
    /// Track a generated scene with this many frames instead of reading input.
    #[clap(long)]
    pub synthetic: Option<usize>,
    /// Tracking parameters as JSON, replacing the command line values.
    #[clap(long)]
    pub config_file: Option<PathBuf>,
    #[clap(long, default_value = "info")]
    pub log_level: LevelFilter,
    #[clap(flatten)]
    pub config: TrackingConfig,
}

fn load_config(args: &Args) -> Result<TrackingConfig> {
    match &args.config_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("failed to parse config {}", path.display()))
        }
        None => Ok(args.config.clone()),
    }
}

fn resume_registry(dir: &Path, color: &ColorClass) -> Result<Option<IdentityRegistry>> {
    let path = rods_path(dir, color);
    if !path.exists() {
        return Ok(None);
    }
    let rods = load_rods(&path)?;
    Ok(Some(IdentityRegistry::seeded(color.clone(), rods)))
}

/// True when `resume` and `output` name the same existing folder.
fn same_folder(resume: &Path, output: &Path) -> bool {
    match (resume.canonicalize(), output.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn main() -> Result<()> {
    // parse the config
    let args = Args::parse();
    let config = load_config(&args)?;

    // setup logging
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stdout_writer())
                .with_filter(args.log_level),
        )
        .with(indicatif_layer)
        .init();

    let rig = load_stereo_rig(&args.calibration)?;
    let requested: Vec<ColorClass> = args.colors.iter().map(ColorClass::new).collect();

    let detections = match (args.synthetic, &args.input) {
        (Some(frames), _) => {
            let colors = if requested.is_empty() {
                vec![ColorClass::new("synthetic")]
            } else {
                requested.clone()
            };
            let settings = SceneSettings {
                frames,
                seed: config.seed,
                ..Default::default()
            };
            let scene = Scene::generate(&rig, &settings, &colors);
            colors
                .iter()
                .map(|c| (c.clone(), scene.detections(c)))
                .collect::<BTreeMap<_, _>>()
        }
        (None, Some(input)) => {
            let colors = (!requested.is_empty()).then_some(requested.as_slice());
            load_detections(input, colors, None)?
        }
        (None, None) => bail!("either --input or --synthetic is required"),
    };

    let last_frame = match args.last_frame {
        Some(last) => last,
        None => detections
            .values()
            .filter_map(|frames| frames.keys().next_back())
            .max()
            .copied()
            .ok_or(anyhow!("no detections to process"))?,
    };
    if last_frame < args.first_frame {
        bail!("last frame {} precedes first frame {}", last_frame, args.first_frame);
    }

    let mut inputs = Vec::new();
    for (color, frames) in detections {
        let registry = match &args.resume {
            Some(dir) => resume_registry(dir, &color)?,
            None => None,
        };
        let first_frame = registry
            .as_ref()
            .and_then(|r| r.last_frame())
            .map_or(args.first_frame, |last| args.first_frame.max(last + 1));
        inputs.push(ColorInput {
            color,
            frames: first_frame..last_frame + 1,
            detections: frames,
            registry,
        });
    }

    let mut controller = SequenceController::new(&rig, config.sequence_settings());
    if let Some(path) = &args.transformation {
        controller = controller.with_world_transform(load_world_transform(path)?);
    }

    let span = info_span!("tracking");
    let _enter = span.enter();

    // persistence runs on its own thread
    let (sender, receiver) = channel::<FrameOutput>();
    let output_dir = args.output.clone();
    let append = args
        .resume
        .as_deref()
        .map_or(false, |dir| same_folder(dir, &output_dir));
    if append {
        info!("appending to the rods in {}", output_dir.display());
    }
    let writer = thread::spawn(move || -> Result<(usize, StatsCollector)> {
        let mut writer = if append {
            RodWriter::appending(&output_dir)?
        } else {
            RodWriter::new(&output_dir)?
        };
        let mut stats = StatsCollector::new();
        for output in receiver {
            stats.record(&output);
            writer.write(&output)?;
        }
        Ok((writer.finish()?, stats))
    });

    let runs = controller.run(inputs, Some(sender));
    let (written, mut stats) = writer
        .join()
        .map_err(|_| anyhow!("writer thread panicked"))??;
    for run in &runs {
        stats.record_run(run);
    }

    let summary = stats.summary();
    let summary_path = args.output.join("summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("failed to write {}", summary_path.display()))?;
    info!(
        "wrote {} rods of {} colors to {}, mean reprojection cost {:.3}",
        written,
        runs.len(),
        args.output.display(),
        summary.reprojection_cost.mean
    );

    Ok(())
}
