//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (readiness probe, workflow submission,
//! history retrieval, image download) using [`reqwest`].

use std::time::Duration;

use podgen_core::workflow::WorkflowGraph;
use serde::Deserialize;

use crate::history::{parse_history, HistoryEntry, ImageRef};

/// Upper bound for a single readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound for submission, history and image requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    client_id: String,
    request_timeout: Duration,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors; empty when the graph was accepted.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// `/prompt` answered 2xx without a `prompt_id`.
    #[error("ComfyUI did not return a prompt_id")]
    MissingPromptId { body: serde_json::Value },

    /// A response body did not have the expected shape.
    #[error("Unexpected response from ComfyUI: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ComfyUIApiError {
    /// Diagnostic payload from the engine, if the error carries one.
    ///
    /// JSON error bodies are returned as-is, anything else as a string.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ApiError { body, .. } => Some(
                serde_json::from_str(body)
                    .unwrap_or_else(|_| serde_json::Value::String(body.clone())),
            ),
            Self::MissingPromptId { body } => Some(body.clone()),
            Self::Request(_) | Self::Decode(_) => None,
        }
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            api_url,
            client_id: uuid::Uuid::new_v4().to_string(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout for everything but the probe.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Client ID sent with every submission.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Readiness probe: `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow and this
    /// client's ID. Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &WorkflowGraph,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        if body.get("prompt_id").and_then(|v| v.as_str()).is_none() {
            return Err(ComfyUIApiError::MissingPromptId { body });
        }
        Ok(SubmitResponse::deserialize(&body)?)
    }

    /// Retrieve the history entry for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. Returns `None` while
    /// the engine has not recorded the prompt yet.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(parse_history(prompt_id, &body)?)
    }

    /// Download a produced image: `GET /view?filename=&subfolder=&type=`.
    pub async fn view_image(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .timeout(self.request_timeout)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn workflow() -> WorkflowGraph {
        WorkflowGraph::from_value(&json!({
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "out" } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn system_stats_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system_stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "system": { "os": "posix" } })))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let stats = api.system_stats().await.unwrap();
        assert_eq!(stats["system"]["os"], "posix");
    }

    #[tokio::test]
    async fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::new("http://127.0.0.1:8188/");
        assert_eq!(api.api_url(), "http://127.0.0.1:8188");
    }

    #[tokio::test]
    async fn submit_sends_prompt_and_client_id() {
        let server = MockServer::start().await;
        let api = ComfyUIApi::new(server.uri());

        Mock::given(method("POST"))
            .and(path("/prompt"))
            .and(body_partial_json(json!({
                "prompt": { "9": { "class_type": "SaveImage" } },
                "client_id": api.client_id(),
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "prompt_id": "p-1", "number": 3, "node_errors": {} })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = api.submit_workflow(&workflow()).await.unwrap();
        assert_eq!(response.prompt_id, "p-1");
        assert_eq!(response.number, 3);
    }

    #[tokio::test]
    async fn submit_without_prompt_id_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "number": 1 })))
            .mount(&server)
            .await;

        let err = ComfyUIApi::new(server.uri())
            .submit_workflow(&workflow())
            .await
            .unwrap_err();
        assert_matches!(&err, ComfyUIApiError::MissingPromptId { .. });
        assert_eq!(err.details().unwrap()["number"], 1);
    }

    #[tokio::test]
    async fn submit_validation_failure_carries_engine_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation" },
                "node_errors": { "9": { "errors": [] } }
            })))
            .mount(&server)
            .await;

        let err = ComfyUIApi::new(server.uri())
            .submit_workflow(&workflow())
            .await
            .unwrap_err();
        assert_matches!(&err, ComfyUIApiError::ApiError { status: 400, .. });
        let details = err.details().unwrap();
        assert_eq!(details["error"]["type"], "prompt_outputs_failed_validation");
    }

    #[tokio::test]
    async fn non_json_error_body_becomes_string_details() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system_stats"))
            .respond_with(ResponseTemplate::new(503).set_body_string("starting up"))
            .mount(&server)
            .await;

        let err = ComfyUIApi::new(server.uri()).system_stats().await.unwrap_err();
        assert_eq!(err.details(), Some(json!("starting up")));
    }

    #[tokio::test]
    async fn history_is_parsed_for_the_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "p-1": {
                    "outputs": { "9": { "images": [{ "filename": "out_00001_.png", "subfolder": "", "type": "output" }] } },
                    "status": { "status_str": "success", "completed": true }
                }
            })))
            .mount(&server)
            .await;

        let entry = ComfyUIApi::new(server.uri())
            .get_history("p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.output_images()[0].image.filename, "out_00001_.png");
    }

    #[tokio::test]
    async fn view_image_passes_query_and_returns_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view"))
            .and(query_param("filename", "out_00001_.png"))
            .and(query_param("subfolder", "batch"))
            .and(query_param("type", "output"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, b'P', b'N', b'G']))
            .mount(&server)
            .await;

        let bytes = ComfyUIApi::new(server.uri())
            .view_image(&ImageRef {
                filename: "out_00001_.png".into(),
                subfolder: "batch".into(),
                folder_type: "output".into(),
            })
            .await
            .unwrap();
        assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn unreachable_engine_is_request_error() {
        let api = ComfyUIApi::new("http://127.0.0.1:9");
        assert_matches!(api.system_stats().await, Err(ComfyUIApiError::Request(_)));
    }

    #[tokio::test]
    async fn stalled_image_download_hits_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0x89, b'P', b'N', b'G'])
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri()).with_request_timeout(Duration::from_millis(100));
        let err = api
            .view_image(&ImageRef {
                filename: "out_00001_.png".into(),
                subfolder: String::new(),
                folder_type: "output".into(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, ComfyUIApiError::Request(e) if e.is_timeout());
    }
}
