//! Job input and result payloads.
//!
//! The hosting queue hands the worker one JSON mapping per job and
//! expects one JSON mapping back. [`JobInput`] is the typed view of the
//! former, [`JobResult`] produces the latter.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::CoreError;
use crate::seed::{resolve_seed, RANDOM_SEED_SENTINEL};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_PROMPT: &str = "a beautiful landscape";
pub const DEFAULT_GUIDANCE: f64 = 4.0;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_DIMENSION: u32 = 1024;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A named base64-encoded reference image supplied by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InputImage {
    /// Symbolic name; patch values equal to it are replaced with the
    /// staged filename.
    pub name: String,
    /// Base64 payload, optionally as a `data:` URL.
    pub image: String,
}

/// Recognized keys of a job's `input` mapping. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobInput {
    pub prompt: Option<String>,
    pub guidance: Option<f64>,
    pub steps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<i64>,
    /// Legacy single reference image, bound to the profile's image slot.
    pub image: Option<String>,
    #[serde(default)]
    pub images: Vec<InputImage>,
    /// Raw workflow graph (API or UI format).
    pub workflow: Option<Value>,
    /// `node_id -> {input: value}` overwrites applied after the bindings.
    #[serde(default)]
    pub modifications: BTreeMap<String, Map<String, Value>>,
}

impl JobInput {
    /// Decode a job's `input` mapping. `null` is treated as an empty input.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => Self::deserialize(value)
                .map_err(|e| CoreError::Validation(format!("Invalid job input: {e}"))),
            other => Err(CoreError::Validation(format!(
                "Job input must be an object, got {}",
                json_type_name(other)
            ))),
        }
    }

    /// Merge the caller's values over `defaults`, validate them, and
    /// resolve a `-1` seed to a concrete value.
    pub fn resolve<R: Rng>(&self, defaults: &GenerationParams, rng: &mut R) -> Result<GenerationParams, CoreError> {
        let params = GenerationParams {
            prompt: self.prompt.clone().unwrap_or_else(|| defaults.prompt.clone()),
            guidance: self.guidance.unwrap_or(defaults.guidance),
            steps: self.steps.unwrap_or(defaults.steps),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            seed: resolve_seed(self.seed.unwrap_or(defaults.seed), rng),
        };
        params.validate()?;
        Ok(params)
    }
}

/// Fully-resolved generation parameters for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub prompt: String,
    pub guidance: f64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            guidance: DEFAULT_GUIDANCE,
            steps: DEFAULT_STEPS,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            seed: RANDOM_SEED_SENTINEL,
        }
    }
}

impl GenerationParams {
    fn validate(&self) -> Result<(), CoreError> {
        if self.steps == 0 {
            return Err(CoreError::Validation("steps must be at least 1".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::Validation(format!(
                "width and height must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.guidance.is_finite() {
            return Err(CoreError::Validation("guidance must be a finite number".to_string()));
        }
        if self.seed < 0 {
            return Err(CoreError::Validation(format!(
                "seed must be -1 or a non-negative integer, got {}",
                self.seed
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Failure categories reported to the caller as `error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The engine never answered its readiness probe.
    EngineUnavailable,
    /// The job input was malformed or incomplete.
    InvalidInput,
    /// The engine refused the submitted graph.
    SubmissionRejected,
    /// The engine accepted the graph but execution failed.
    ExecutionFailed,
    /// Execution did not finish within the polling budget.
    Timeout,
    /// Anything else.
    Unexpected,
}

/// One produced image, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedImage {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub folder_type: String,
    /// Base64 (standard alphabet) of the raw image bytes.
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSuccess {
    pub status: &'static str,
    /// First produced image; kept for callers that expect a single image.
    pub image: String,
    pub images: Vec<EncodedImage>,
    pub seed: i64,
    pub prompt: String,
    pub prompt_id: String,
    /// `"node_id.input" -> seed` for every `-1` seed replaced in the graph.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub normalized_seeds: BTreeMap<String, u64>,
}

impl JobSuccess {
    pub fn new(images: Vec<EncodedImage>, params: &GenerationParams, prompt_id: String) -> Self {
        Self {
            status: "success",
            image: images.first().map(|i| i.image.clone()).unwrap_or_default(),
            images,
            seed: params.seed,
            prompt: params.prompt.clone(),
            prompt_id,
            normalized_seeds: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub error: String,
    pub error_kind: ErrorKind,
    /// Raw diagnostic payload from the engine, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// The mapping returned to the job queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobResult {
    Success(JobSuccess),
    Failure(JobFailure),
}

impl JobResult {
    pub fn failure(error_kind: ErrorKind, error: impl Into<String>, details: Option<Value>) -> Self {
        Self::Failure(JobFailure {
            error: error.into(),
            error_kind,
            details,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure.error_kind),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            json!({
                "error": format!("Failed to serialize job result: {e}"),
                "error_kind": ErrorKind::Unexpected,
            })
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
