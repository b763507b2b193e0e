//! The job handler: one job input in, one result mapping out.
//!
//! A job runs strictly in sequence: decode and validate the input,
//! acquire the workflow graph, wait for the engine, stage reference
//! images, patch the graph, normalize seeds, submit, then poll until the
//! engine reports images, an error, or the timeout elapses.
//!
//! [`JobHandler::handle`] never fails. Every error, including a panic
//! inside the pipeline, is turned into a [`JobResult::Failure`].

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::FutureExt;
use serde_json::{json, Value};

use podgen_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use podgen_comfyui::engine::ExecutionEngine;
use podgen_comfyui::history::OutputImage;
use podgen_comfyui::poll::{wait_for_images, PollConfig, PollError};
use podgen_comfyui::readiness::{wait_until_ready, ReadinessConfig, ReadinessError};
use podgen_core::error::CoreError;
use podgen_core::job::{EncodedImage, ErrorKind, JobInput, JobResult, JobSuccess};
use podgen_core::patch::{apply_patches, ParamAllowList, PatchSet};
use podgen_core::profile::{GraphSource, WorkflowProfile};
use podgen_core::seed::normalize_seeds;
use podgen_core::workflow::WorkflowGraph;

use crate::config::{ConfigError, WorkerConfig};
use crate::staging::{AssetStager, StagingError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    EngineUnavailable(#[from] ReadinessError),

    #[error("Failed to queue workflow: {0}")]
    SubmissionRejected(#[source] ComfyUIApiError),

    #[error("{message}")]
    ExecutionFailed { message: String, details: Value },

    #[error("Timeout waiting for image generation after {0:?}")]
    Timeout(Duration),

    #[error("{message}")]
    Unexpected {
        message: String,
        details: Option<Value>,
    },
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            Self::SubmissionRejected(_) => ErrorKind::SubmissionRejected,
            Self::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unexpected { .. } => ErrorKind::Unexpected,
        }
    }

    /// Raw diagnostic payload from the engine, when there is one.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::SubmissionRejected(e) => e.details(),
            Self::ExecutionFailed { details, .. } => Some(details.clone()),
            Self::Unexpected { details, .. } => details.clone(),
            Self::InvalidInput(_) | Self::EngineUnavailable(_) | Self::Timeout(_) => None,
        }
    }

    pub fn into_result(self) -> JobResult {
        JobResult::failure(self.kind(), self.to_string(), self.details())
    }

    fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
            details: None,
        }
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::InvalidInput(msg),
            other => Self::unexpected(other.to_string()),
        }
    }
}

impl From<StagingError> for HandlerError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::Io { .. } => Self::unexpected(err.to_string()),
            StagingError::Decode { .. } | StagingError::NotAnImage { .. } => {
                Self::InvalidInput(err.to_string())
            }
        }
    }
}

impl From<PollError> for HandlerError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::ExecutionFailed { details } => Self::ExecutionFailed {
                message: "Workflow execution failed".to_string(),
                details,
            },
            PollError::NoImages { details } => Self::ExecutionFailed {
                message: "Workflow finished without producing images".to_string(),
                details,
            },
            PollError::Timeout(timeout) => Self::Timeout(timeout),
            PollError::Api(e) => Self::Unexpected {
                message: format!("Failed to poll workflow history: {e}"),
                details: e.details(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct JobHandler {
    engine: Arc<dyn ExecutionEngine>,
    profile: WorkflowProfile,
    workflow_dir: PathBuf,
    stager: AssetStager,
    readiness: ReadinessConfig,
    poll: PollConfig,
    allow_list: ParamAllowList,
}

impl JobHandler {
    pub fn new(engine: Arc<dyn ExecutionEngine>, profile: WorkflowProfile, config: &WorkerConfig) -> Self {
        Self {
            engine,
            profile,
            workflow_dir: config.workflow_dir.clone(),
            stager: AssetStager::new(config.input_dir.clone()),
            readiness: config.readiness.clone(),
            poll: config.poll.clone(),
            allow_list: ParamAllowList::builtin(),
        }
    }

    /// Build a handler talking to the ComfyUI instance named in `config`.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, ConfigError> {
        let profile = config.resolve_profile()?;
        let engine = Arc::new(ComfyUIApi::new(config.comfy_api_url.clone()));
        Ok(Self::new(engine, profile, config))
    }

    pub fn with_allow_list(mut self, allow_list: ParamAllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    pub fn profile(&self) -> &WorkflowProfile {
        &self.profile
    }

    pub fn engine_url(&self) -> &str {
        self.engine.url()
    }

    /// Run one job. Never panics and never returns an error; failures are
    /// reported in the returned [`JobResult`].
    pub async fn handle(&self, input: &Value) -> JobResult {
        match AssertUnwindSafe(self.run(input)).catch_unwind().await {
            Ok(Ok(success)) => JobResult::Success(success),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, kind = ?e.kind(), "Job failed");
                e.into_result()
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %message, "Job handler panicked");
                JobResult::failure(ErrorKind::Unexpected, format!("Internal error: {message}"), None)
            }
        }
    }

    async fn run(&self, input: &Value) -> Result<JobSuccess, HandlerError> {
        // Everything that can be rejected without the engine happens first.
        let job = JobInput::from_value(input)?;
        let mut graph = self.acquire_graph(&job)?;
        let params = job.resolve(&self.profile.defaults, &mut rand::rng())?;
        let images = self.stager.decode(&job)?;

        tracing::info!(
            profile = %self.profile.name,
            nodes = graph.len(),
            seed = params.seed,
            steps = params.steps,
            width = params.width,
            height = params.height,
            reference_images = images.len(),
            "Processing job",
        );

        wait_until_ready(self.engine.as_ref(), &self.readiness).await?;

        let staged = self.stager.write(images).await?;

        let mut patches = self.profile.binding_patches(&params, staged.primary.as_deref());
        let mut modifications = PatchSet::new();
        modifications.extend_from_modifications(&job.modifications);
        let substituted = modifications.substitute_strings(&staged.substitutions);
        if substituted > 0 {
            tracing::debug!(substituted, "Substituted staged image filenames");
        }
        for patch in modifications.iter() {
            patches.set(patch.node_id.clone(), patch.input.clone(), patch.value.clone());
        }

        let report = apply_patches(&mut graph, &patches, &self.allow_list);
        for skipped in &report.skipped {
            tracing::warn!(
                node_id = %skipped.patch.node_id,
                input = %skipped.patch.input,
                reason = ?skipped.reason,
                "Skipped workflow patch",
            );
        }
        for dangling in graph.dangling_references() {
            tracing::warn!(
                from_node = %dangling.from_node,
                to_node = %dangling.to_node,
                to_input = %dangling.to_input,
                "Workflow references a missing node",
            );
        }

        let assignments = normalize_seeds(&mut graph, &mut rand::rng());
        for assignment in &assignments {
            tracing::info!(
                node_id = %assignment.node_id,
                input = %assignment.input,
                seed = assignment.seed,
                "Assigned random seed",
            );
        }

        let submitted = self
            .engine
            .submit(&graph)
            .await
            .map_err(HandlerError::SubmissionRejected)?;
        tracing::info!(prompt_id = %submitted.prompt_id, queue_number = submitted.number, "Workflow queued");

        let outputs = wait_for_images(self.engine.as_ref(), &submitted.prompt_id, &self.poll).await?;
        let images = self.encode_outputs(outputs).await?;

        // Modifications may have overridden a binding; report what ran.
        let echoed = self.profile.params_in_graph(&graph, &params);
        let mut success = JobSuccess::new(images, &echoed, submitted.prompt_id);
        success.normalized_seeds = assignments
            .into_iter()
            .map(|a| (format!("{}.{}", a.node_id, a.input), a.seed))
            .collect::<BTreeMap<_, _>>();
        Ok(success)
    }

    /// Caller-supplied graph first, then the profile's bundled graph.
    fn acquire_graph(&self, job: &JobInput) -> Result<WorkflowGraph, HandlerError> {
        if let Some(workflow) = &job.workflow {
            return Ok(WorkflowGraph::from_any(workflow)?);
        }

        match &self.profile.graph {
            GraphSource::CallerSupplied => Err(HandlerError::InvalidInput(format!(
                "Profile {} requires a workflow in the job input",
                self.profile.name
            ))),
            GraphSource::Bundled { file } => {
                let path = self.workflow_dir.join(file);
                WorkflowGraph::load_bundled(&path).map_err(|e| match e {
                    CoreError::Io { .. } => HandlerError::Unexpected {
                        message: format!("Workflow file not found: {}", path.display()),
                        details: Some(json!({ "path": path.display().to_string() })),
                    },
                    other => HandlerError::unexpected(format!("Invalid bundled workflow: {other}")),
                })
            }
        }
    }

    async fn encode_outputs(&self, outputs: Vec<OutputImage>) -> Result<Vec<EncodedImage>, HandlerError> {
        let mut images = Vec::with_capacity(outputs.len());
        for output in outputs {
            let bytes = self.engine.fetch_image(&output.image).await.map_err(|e| {
                HandlerError::Unexpected {
                    message: format!("Failed to fetch image {}: {e}", output.image.filename),
                    details: e.details(),
                }
            })?;
            tracing::debug!(filename = %output.image.filename, bytes = bytes.len(), "Fetched output image");

            images.push(EncodedImage {
                node_id: output.node_id,
                filename: output.image.filename,
                subfolder: output.image.subfolder,
                folder_type: output.image.folder_type,
                image: base64::engine::general_purpose::STANDARD.encode(&bytes),
            });
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn poll_errors_map_to_taxonomy() {
        let failed: HandlerError = PollError::ExecutionFailed {
            details: json!({ "status": { "status_str": "error" } }),
        }
        .into();
        assert_eq!(failed.kind(), ErrorKind::ExecutionFailed);
        assert_eq!(failed.details().unwrap()["status"]["status_str"], "error");

        let empty: HandlerError = PollError::NoImages { details: json!({}) }.into();
        assert_eq!(empty.kind(), ErrorKind::ExecutionFailed);
        assert!(empty.to_string().contains("without producing images"));

        let timeout: HandlerError = PollError::Timeout(Duration::from_secs(300)).into();
        assert_matches!(timeout, HandlerError::Timeout(_));
        assert!(timeout.to_string().starts_with("Timeout waiting for image generation"));
    }

    #[test]
    fn submission_rejection_keeps_engine_body() {
        let err = HandlerError::SubmissionRejected(ComfyUIApiError::ApiError {
            status: 400,
            body: r#"{"error": {"type": "invalid_prompt"}}"#.into(),
        });
        let result = err.into_result().to_value();

        assert_eq!(result["error_kind"], "submission_rejected");
        assert_eq!(result["details"]["error"]["type"], "invalid_prompt");
    }

    #[test]
    fn validation_errors_are_invalid_input() {
        let err: HandlerError = CoreError::Validation("steps must be at least 1".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.details().is_none());
    }

    #[test]
    fn staging_io_errors_are_unexpected() {
        let err: HandlerError = StagingError::Io {
            path: "/comfyui/input/input_image.png".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
    }
}
