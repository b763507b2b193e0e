//! Completion polling for a submitted prompt.

use std::time::Duration;

use tokio::time::Instant;

use crate::api::ComfyUIApiError;
use crate::engine::ExecutionEngine;
use crate::history::{HistoryOutcome, OutputImage};

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between history requests.
    pub interval: Duration,
    /// Overall budget measured from the first request.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The engine recorded the prompt with an error status.
    #[error("Workflow execution failed")]
    ExecutionFailed { details: serde_json::Value },

    #[error("Workflow finished without producing images")]
    NoImages { details: serde_json::Value },

    #[error("Timeout waiting for image generation after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),
}

/// Poll the history of `prompt_id` until it yields images, fails, or the
/// timeout elapses.
///
/// The error status is checked before outputs. Transport errors from the
/// history endpoint are returned immediately. A history request still in
/// flight at the deadline is abandoned and reported as a timeout.
pub async fn wait_for_images<E: ExecutionEngine + ?Sized>(
    engine: &E,
    prompt_id: &str,
    config: &PollConfig,
) -> Result<Vec<OutputImage>, PollError> {
    let deadline = Instant::now() + config.timeout;
    let mut polls = 0u32;

    loop {
        polls += 1;
        let Ok(entry) = tokio::time::timeout_at(deadline, engine.history(prompt_id)).await else {
            tracing::warn!(prompt_id, polls, "History request outlived the polling budget");
            return Err(PollError::Timeout(config.timeout));
        };
        if let Some(entry) = entry? {
            match entry.outcome() {
                HistoryOutcome::Failed => {
                    tracing::warn!(prompt_id, polls, "ComfyUI reported an execution error");
                    return Err(PollError::ExecutionFailed { details: entry.raw });
                }
                HistoryOutcome::Completed(images) => {
                    tracing::info!(prompt_id, polls, images = images.len(), "Workflow completed");
                    return Ok(images);
                }
                HistoryOutcome::NoImages => {
                    tracing::warn!(prompt_id, polls, "Workflow completed without images");
                    return Err(PollError::NoImages { details: entry.raw });
                }
                HistoryOutcome::Pending => {}
            }
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(prompt_id, polls, "Timed out waiting for workflow");
            return Err(PollError::Timeout(config.timeout));
        }
        tokio::time::sleep(config.interval.min(deadline - now)).await;
    }
}
