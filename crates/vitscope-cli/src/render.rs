//! Report rendering

use serde_json::Value;
use std::io::{self, Write};

use crate::report::{FileReport, ReportError, Summary};

/// Shown for config fields that are absent
pub const NOT_SPECIFIED: &str = "Not specified";

/// `[3, 256, 512]`
fn format_list<'a>(values: impl IntoIterator<Item = &'a usize>) -> String {
    let items: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

/// Strings print bare, everything else as JSON
pub fn format_config_value(value: Option<&Value>) -> String {
    match value {
        None => NOT_SPECIFIED.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// `256 or 512`
fn important_label(sizes: &[usize]) -> String {
    sizes
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" or ")
}

pub fn write_file_report<W: Write>(
    out: &mut W,
    file: &FileReport,
    important_sizes: &[usize],
) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Analyzing {}:", file.file_name)?;
    writeln!(out, "Unique sizes found: {}", format_list(&file.shapes.sizes))?;
    writeln!(out, "Important shapes ({}):", important_label(important_sizes))?;
    for (name, shape) in &file.shapes.important_shapes {
        writeln!(out, "  {}: shape = {}", name, format_list(shape))?;
    }
    Ok(())
}

pub fn write_summary<W: Write>(out: &mut W, summary: &Summary) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Overall summary:")?;
    writeln!(
        out,
        "All unique sizes found across models: {}",
        format_list(&summary.overall.sizes)
    )?;

    let config = &summary.config;
    writeln!(out)?;
    writeln!(out, "Important config information:")?;
    writeln!(out, "Model name: {}", format_config_value(config.model_name.as_ref()))?;
    writeln!(out, "Version: {}", format_config_value(config.version.as_ref()))?;
    writeln!(out, "Gin channels: {}", format_config_value(config.gin_channels.as_ref()))?;
    writeln!(
        out,
        "Hidden channels: {}",
        format_config_value(config.hidden_channels.as_ref())
    )?;
    Ok(())
}

pub fn write_json<W: Write>(out: &mut W, summary: &Summary) -> Result<(), ReportError> {
    serde_json::to_writer_pretty(&mut *out, summary)?;
    writeln!(out)?;
    Ok(())
}
