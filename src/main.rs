// Command-line runner for the `streak_eraser` library.
// Reads a directory of TIFF frames and writes the repainted frames next to it.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use streak_eraser::pipeline::CONFIG_FILE;
use streak_eraser::{PipelineConfig, StreakEraser};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Removes airplane streaks from astronomical image sequences", long_about = None)]
struct Args {
    #[arg(help = "Directory holding the frames, one TIFF per frame")]
    input_dir: PathBuf,

    #[arg(short, long, help = "Output directory (default: <input>-no-planes)")]
    output_dir: Option<PathBuf>,

    #[arg(long, help = "Outlier percent a pixel must exceed to be detected")]
    outlier_min_threshold: Option<f64>,

    #[arg(long, help = "Groups must be larger than this to be considered")]
    min_group_size: Option<usize>,

    #[arg(short = 'n', long, help = "Frames analyzed concurrently")]
    max_concurrent: Option<usize>,

    #[arg(long, help = "Groups at least this large are painted without classification")]
    assume_airplane_size: Option<usize>,

    #[arg(short, long, help = "Also write frames colored by paint reason")]
    test_paint: bool,

    #[arg(long, help = "Frames on each side that take part in reconciliation")]
    neighbor_radius: Option<usize>,

    #[arg(long, help = "Padding radius around painted groups, 0 disables padding")]
    padding: Option<u32>,

    #[arg(short, long, help = "Built-in classifier name or path of a forest JSON file")]
    classifier: Option<String>,

    #[arg(long, help = "JSON configuration file, overridden by the flags given here")]
    config: Option<PathBuf>,

    #[arg(long, help = "Write every group's features to features.csv in the output directory")]
    feature_csv: bool,

    #[arg(short, long, help = "Log per-frame detail")]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<(PipelineConfig, PathBuf, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::read_from(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(value) = self.outlier_min_threshold {
            config.outlier_min_threshold = value;
        }
        if let Some(value) = self.min_group_size {
            config.min_group_size = value;
        }
        if let Some(value) = self.max_concurrent {
            config.max_concurrent = value;
        }
        if let Some(value) = self.assume_airplane_size {
            config.assume_airplane_size = value;
        }
        if let Some(value) = self.neighbor_radius {
            config.neighbor_radius = value;
        }
        if let Some(value) = self.padding {
            config.padding_radius = value;
        }
        if let Some(value) = self.classifier {
            config.classifier = value;
        }
        config.test_paint |= self.test_paint;
        config.write_feature_csv |= self.feature_csv;
        Ok((config, self.input_dir, self.output_dir))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose {
        "streak_eraser=debug"
    } else {
        "streak_eraser=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let (config, input_dir, output_dir) = args.into_config()?;
    let eraser = StreakEraser::new(config).context("invalid configuration")?;
    let output_dir = output_dir.unwrap_or_else(|| eraser.config().output_dir_for(&input_dir));

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    eraser
        .config()
        .write_to(&output_dir.join(CONFIG_FILE))
        .context("saving the run configuration")?;

    let summary = eraser
        .run_directory(&input_dir, Some(&output_dir))
        .await
        .with_context(|| format!("processing {}", input_dir.display()))?;

    info!(
        frames = summary.frames,
        processed = summary.processed,
        skipped = summary.skipped,
        painted_groups = summary.painted_groups,
        painted_pixels = summary.painted_pixels,
        written = summary.written,
        "done, output in {}",
        output_dir.display()
    );
    Ok(())
}
