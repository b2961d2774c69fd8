//! Report driver: load each checkpoint, analyze it and summarize the run

use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use vitscope_checkpoint::{
    analyze_model_structure_with, load_model, Checkpoint, ShapeReport, DEFAULT_IMPORTANT_SIZES,
};

use crate::config::TrainingConfig;
use crate::render;

/// Errors that abort a report run
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Config has no \"{0}\" section")]
    MissingConfigSection(&'static str),

    #[error("{}: {source}", .path.display())]
    Checkpoint {
        path: PathBuf,
        source: vitscope_checkpoint::Error,
    },

    #[error("Failed to write report: {0}")]
    Output(#[from] io::Error),

    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the report is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Per-file sections as they are processed, then the summary
    #[default]
    Text,
    /// One JSON document after every file has been processed
    Json,
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Last-dimension widths whose tensors are listed
    pub important_sizes: Vec<usize>,
    pub format: OutputFormat,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            important_sizes: DEFAULT_IMPORTANT_SIZES.to_vec(),
            format: OutputFormat::Text,
        }
    }
}

/// Analysis of one checkpoint file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file_name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub shapes: ShapeReport,
}

/// Config fields shown at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub model_name: Option<Value>,
    pub version: Option<Value>,
    pub gin_channels: Option<Value>,
    pub hidden_channels: Option<Value>,
}

impl ConfigSummary {
    /// Fails when the config has no `model` section
    pub fn from_config(config: &TrainingConfig) -> Result<Self, ReportError> {
        let model = config.model_section()?;
        Ok(Self {
            model_name: config.model_name().cloned(),
            version: config.version().cloned(),
            gin_channels: model.gin_channels().cloned(),
            hidden_channels: model.hidden_channels().cloned(),
        })
    }
}

/// Everything a completed run produced
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub important_sizes: Vec<usize>,
    pub files: Vec<FileReport>,
    /// Union over all files; later files win on important-shape name clashes
    pub overall: ShapeReport,
    pub config: ConfigSummary,
}

/// Running totals across the files of one run
#[derive(Debug, Default)]
pub struct Accumulator {
    important_sizes: Vec<usize>,
    files: Vec<FileReport>,
    overall: ShapeReport,
}

impl Accumulator {
    pub fn new(important_sizes: &[usize]) -> Self {
        Self {
            important_sizes: important_sizes.to_vec(),
            ..Self::default()
        }
    }

    /// Analyze a loaded checkpoint and fold it into the totals.
    ///
    /// A top-level `"model"` mapping is analyzed in place of the checkpoint
    /// itself (one level only).
    pub fn add(&mut self, path: &Path, checkpoint: Checkpoint) -> &FileReport {
        let state = checkpoint.into_model_state();
        if state.is_empty() {
            warn!("{} holds no entries", path.display());
        }
        let shapes = analyze_model_structure_with(&state, &self.important_sizes);
        debug!(
            "{}: {} distinct sizes, {} important tensors",
            path.display(),
            shapes.sizes.len(),
            shapes.important_shapes.len()
        );

        self.overall.merge(&shapes);
        let index = self.files.len();
        self.files.push(FileReport {
            file_name: display_name(path),
            path: path.to_path_buf(),
            shapes,
        });
        &self.files[index]
    }

    pub fn finish(self, config: &TrainingConfig) -> Result<Summary, ReportError> {
        Ok(Summary {
            config: ConfigSummary::from_config(config)?,
            important_sizes: self.important_sizes,
            files: self.files,
            overall: self.overall,
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Load the config, then analyze `model_paths` in order and write the report
/// to `out`.
///
/// The first failing path aborts the run. In text mode the sections of files
/// already processed stay written; the overall summary is only written once
/// every file has been read.
pub fn analyze_models<W: Write>(
    model_paths: &[PathBuf],
    config_path: &Path,
    options: &ReportOptions,
    out: &mut W,
) -> Result<Summary, ReportError> {
    let config = TrainingConfig::load(config_path)?;
    let mut acc = Accumulator::new(&options.important_sizes);

    for path in model_paths {
        info!("Analyzing {}", path.display());
        let checkpoint = load_model(path).map_err(|source| ReportError::Checkpoint {
            path: path.clone(),
            source,
        })?;

        let file = acc.add(path, checkpoint);
        if options.format == OutputFormat::Text {
            render::write_file_report(out, file, &options.important_sizes)?;
        }
    }

    let summary = acc.finish(&config)?;
    match options.format {
        OutputFormat::Text => render::write_summary(out, &summary)?,
        OutputFormat::Json => render::write_json(out, &summary)?,
    }

    Ok(summary)
}
