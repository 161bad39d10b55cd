//! gazeburst CLI — track a pupil and corneal reflections in eye images.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use gazeburst::{EyeTracker, Rect, TrackConfig};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "gazeburst")]
#[command(about = "Track the pupil ellipse and corneal reflections in grayscale eye images")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (overrides RUST_LOG).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track one or more frames and write the results as JSON.
    Track(TrackArgs),

    /// Print the default configuration as JSON.
    ConfigInfo,
}

#[derive(Debug, Clone, Args)]
struct TrackArgs {
    /// Input frames in order (grayscale images).
    #[arg(long, required = true, num_args = 1..)]
    image: Vec<PathBuf>,

    /// Path to write tracking results (JSON array, one entry per frame).
    #[arg(long)]
    out: PathBuf,

    /// Tracker configuration file (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Crop rectangle as `x y width height`.
    #[arg(long, num_args = 4, value_names = ["X", "Y", "W", "H"])]
    crop: Option<Vec<i32>>,

    /// Seed hint for the first frame as `x y`.
    #[arg(long, num_args = 2, value_names = ["X", "Y"])]
    seed: Option<Vec<f32>>,

    /// Override the glint binarization threshold.
    #[arg(long)]
    glint_threshold: Option<u8>,

    /// Override the maximum number of glints (1-20).
    #[arg(long)]
    max_glints: Option<usize>,

    /// Use a fixed pupil threshold instead of the adaptive one.
    #[arg(long)]
    pupil_threshold: Option<u8>,

    /// Disable histogram equalization of the crop.
    #[arg(long)]
    no_equalize: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let result = match cli.command {
        Commands::Track(args) => run_track(args),
        Commands::ConfigInfo => run_config_info(),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(args: &TrackArgs) -> CliResult<TrackConfig> {
    let mut config: TrackConfig = match &args.config {
        Some(path) => serde_json::from_reader(std::fs::File::open(path)?)?,
        None => TrackConfig::default(),
    };
    if let Some(crop) = &args.crop {
        config.crop = Rect::new(crop[0], crop[1], crop[2], crop[3]);
    }
    if let Some(t) = args.glint_threshold {
        config.glint.threshold = t;
    }
    if let Some(n) = args.max_glints {
        config.glint.max_glints = n.clamp(1, 20);
    }
    if let Some(t) = args.pupil_threshold {
        config.auto_pupil_threshold = false;
        config.pupil_threshold = t;
    }
    if args.no_equalize {
        config.equalize = false;
    }
    Ok(config)
}

fn run_track(args: TrackArgs) -> CliResult<()> {
    let config = load_config(&args)?;
    let mut tracker = EyeTracker::new(config);
    let mut seed = args
        .seed
        .as_ref()
        .map(|s| [s[0], s[1]]);

    let mut results = Vec::with_capacity(args.image.len());
    for path in &args.image {
        let gray = image::open(path)
            .map_err(|e| format!("cannot open {}: {}", path.display(), e))?
            .into_luma8();
        let result = tracker.track(&gray, seed.take());
        tracing::info!(
            frame = %path.display(),
            success = result.success,
            n_glints = result.glints.centers.len(),
            "frame processed"
        );
        results.push(result);
    }

    let file = std::fs::File::create(&args.out)?;
    serde_json::to_writer_pretty(file, &results)?;
    println!(
        "tracked {} frame(s), {} successful -> {}",
        results.len(),
        results.iter().filter(|r| r.success).count(),
        args.out.display()
    );
    Ok(())
}

fn run_config_info() -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(&TrackConfig::default())?);
    Ok(())
}
