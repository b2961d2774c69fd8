//! Training configuration access
//!
//! Only a handful of fields are read from the VITS2 `config.json`; everything
//! else is ignored. Accessors return `Option` and leave the "Not specified"
//! fallback to the renderer.

use serde::de::Error as _;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use crate::report::ReportError;

/// The subset of a VITS2 training config this tool reports on.
///
/// A field that is present keeps its JSON value, `null` included; only an
/// absent key is `None`.
#[derive(Debug, Clone, Default)]
pub struct TrainingConfig {
    pub model_name: Option<Value>,
    pub version: Option<Value>,
    /// The `model` hyperparameter section
    pub model: Option<ModelSection>,
}

/// Fields of the `model` section
#[derive(Debug, Clone, Default)]
pub struct ModelSection {
    pub gin_channels: Option<Value>,
    pub hidden_channels: Option<Value>,
}

/// The object behind `value`, or a parse error naming `what`
fn expect_object(value: Value, what: &str) -> serde_json::Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(serde_json::Error::custom(format!(
            "{what} must be a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl TrainingConfig {
    /// Read and decode the JSON config at `path`
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let content = std::fs::read_to_string(path).map_err(|source| ReportError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_json(&content).map_err(|source| ReportError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Decode a config document. The root and the `model` section must be
    /// JSON objects; unknown keys are ignored.
    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        let mut root = expect_object(serde_json::from_str(content)?, "config")?;

        let model = match root.remove("model") {
            Some(section) => {
                let mut section = expect_object(section, "\"model\" section")?;
                Some(ModelSection {
                    gin_channels: section.remove("gin_channels"),
                    hidden_channels: section.remove("hidden_channels"),
                })
            }
            None => None,
        };

        Ok(Self {
            model_name: root.remove("model_name"),
            version: root.remove("version"),
            model,
        })
    }

    pub fn model_name(&self) -> Option<&Value> {
        self.model_name.as_ref()
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    /// The `model` section; its absence is an error, not a default
    pub fn model_section(&self) -> Result<&ModelSection, ReportError> {
        self.model
            .as_ref()
            .ok_or(ReportError::MissingConfigSection("model"))
    }
}

impl ModelSection {
    pub fn gin_channels(&self) -> Option<&Value> {
        self.gin_channels.as_ref()
    }

    pub fn hidden_channels(&self) -> Option<&Value> {
        self.hidden_channels.as_ref()
    }
}
