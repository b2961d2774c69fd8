//! vitscope - inspect VITS2 checkpoints
//!
//! Lists the distinct last-dimension sizes of every tensor in one or more
//! `.safetensors` / `.pth` checkpoints, flags tensors of the widths that
//! matter for speaker and hidden channels, and prints the matching fields of
//! the training config.

use anyhow::Result;
use clap::Parser;
use console::style;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

mod config;
mod render;
mod report;

use report::{analyze_models, OutputFormat, ReportOptions};
use vitscope_checkpoint::DEFAULT_IMPORTANT_SIZES;

#[derive(Parser, Debug)]
#[command(
    name = "vitscope",
    version = env!("CARGO_PKG_VERSION"),
    about = "Analyze VITS2 model files",
    long_about = "Inspects .pth and .safetensors checkpoints, lists the distinct last-dimension sizes of their tensors and the tensors whose last dimension is 256 or 512, and prints the model name, version, gin channels and hidden channels from the training config."
)]
struct Cli {
    /// Path to the config.json file
    config_path: PathBuf,

    /// Paths to the model files (.pth or .safetensors)
    #[arg(required = true)]
    model_paths: Vec<PathBuf>,

    /// Last-dimension size to flag (repeatable)
    #[arg(long = "important-size", value_name = "N", default_values_t = DEFAULT_IMPORTANT_SIZES)]
    important_sizes: Vec<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// JSON output format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    debug!("vitscope v{} starting", env!("CARGO_PKG_VERSION"));

    let options = ReportOptions {
        important_sizes: cli.important_sizes.clone(),
        format: if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        },
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = analyze_models(&cli.model_paths, &cli.config_path, &options, &mut out);
    out.flush()?;

    match result {
        Ok(summary) => {
            info!("Analyzed {} model file(s)", summary.files.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
