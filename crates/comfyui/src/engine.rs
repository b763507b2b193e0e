//! Abstraction over the execution engine consumed by the worker.
//!
//! The job handler only needs four operations from the engine. Keeping
//! them behind a trait lets the readiness and polling loops, and the
//! handler itself, run against an in-memory fake in tests.

use async_trait::async_trait;
use podgen_core::workflow::WorkflowGraph;

use crate::api::{ComfyUIApi, ComfyUIApiError, SubmitResponse};
use crate::history::{HistoryEntry, ImageRef};

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Base URL of the engine, for logging and health output.
    fn url(&self) -> &str;

    /// Succeeds when the engine answers its readiness endpoint.
    async fn probe(&self) -> Result<(), ComfyUIApiError>;

    /// Queue a graph for execution and return its handle.
    async fn submit(&self, graph: &WorkflowGraph) -> Result<SubmitResponse, ComfyUIApiError>;

    /// History entry for `prompt_id`, or `None` if not recorded yet.
    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError>;

    /// Raw bytes of a produced image.
    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError>;
}

#[async_trait]
impl ExecutionEngine for ComfyUIApi {
    fn url(&self) -> &str {
        self.api_url()
    }

    async fn probe(&self) -> Result<(), ComfyUIApiError> {
        self.system_stats().await.map(|_| ())
    }

    async fn submit(&self, graph: &WorkflowGraph) -> Result<SubmitResponse, ComfyUIApiError> {
        self.submit_workflow(graph).await
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.get_history(prompt_id).await
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        self.view_image(image).await
    }
}
