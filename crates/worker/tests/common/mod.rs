#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};

use podgen_comfyui::api::{ComfyUIApiError, SubmitResponse};
use podgen_comfyui::engine::ExecutionEngine;
use podgen_comfyui::history::{parse_history, HistoryEntry, ImageRef};
use podgen_comfyui::poll::PollConfig;
use podgen_comfyui::readiness::ReadinessConfig;
use podgen_core::profile::WorkflowProfile;
use podgen_core::workflow::WorkflowGraph;
use podgen_worker::config::WorkerConfig;
use podgen_worker::handler::JobHandler;

pub const PROMPT_ID: &str = "prompt-1";

/// PNG signature followed by the start of an IHDR chunk.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R'];

pub fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

pub fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Worker configuration with fast readiness/poll timings, the fixture
/// workflow directory and the given staging directory.
pub fn test_config(input_dir: &Path) -> WorkerConfig {
    WorkerConfig {
        comfy_api_url: "http://fake-comfyui".to_string(),
        input_dir: input_dir.to_path_buf(),
        workflow_dir: fixtures_dir(),
        profile: "flux-pulid".to_string(),
        readiness: ReadinessConfig {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        },
        poll: PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        },
        host: "127.0.0.1".to_string(),
        port: 0,
        test_input: None,
    }
}

pub fn build_handler(engine: Arc<FakeEngine>, profile: WorkflowProfile, input_dir: &Path) -> JobHandler {
    JobHandler::new(engine, profile, &test_config(input_dir))
}

/// History body reporting one finished image on node 9.
pub fn history_with_image(filename: &str) -> Value {
    json!({
        PROMPT_ID: {
            "outputs": { "9": { "images": [{ "filename": filename, "subfolder": "", "type": "output" }] } },
            "status": { "status_str": "success", "completed": true, "messages": [] }
        }
    })
}

pub fn history_with_error() -> Value {
    json!({
        PROMPT_ID: {
            "outputs": {},
            "status": {
                "status_str": "error",
                "completed": false,
                "messages": [["execution_error", { "node_id": "26", "exception_message": "CUDA out of memory" }]]
            }
        }
    })
}

pub fn history_pending() -> Value {
    json!({})
}

/// In-memory execution engine with scripted responses.
pub struct FakeEngine {
    /// Probes that fail before the engine reports ready.
    pub probe_failures: u32,
    /// `Some(body)` makes `/prompt` answer 400 with that body.
    pub reject_with: Option<Value>,
    /// History bodies returned in order; the last one repeats.
    pub history: Mutex<Vec<Value>>,
    /// Filename -> bytes served by the image endpoint.
    pub images: HashMap<String, Vec<u8>>,

    pub probes: AtomicU32,
    pub history_calls: AtomicU32,
    pub submitted: Mutex<Vec<Value>>,
    pub fetched: Mutex<Vec<ImageRef>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            probe_failures: 0,
            reject_with: None,
            history: Mutex::new(vec![history_pending()]),
            images: HashMap::new(),
            probes: AtomicU32::new(0),
            history_calls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// An engine that finishes on the second poll with one image.
    pub fn producing(filename: &str, bytes: &[u8]) -> Self {
        let mut engine = Self::new().with_history(vec![history_pending(), history_with_image(filename)]);
        engine.images.insert(filename.to_string(), bytes.to_vec());
        engine
    }

    pub fn with_history(self, bodies: Vec<Value>) -> Self {
        *self.history.lock().unwrap() = bodies;
        self
    }

    pub fn never_ready() -> Self {
        Self {
            probe_failures: u32::MAX,
            ..Self::new()
        }
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    /// The single graph submitted so far.
    pub fn submitted_graph(&self) -> Value {
        let submitted = self.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1, "expected exactly one submission");
        submitted[0].clone()
    }

    /// Total number of engine calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.probes() as usize
            + self.submission_count()
            + self.history_calls.load(Ordering::SeqCst) as usize
            + self.fetched.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutionEngine for FakeEngine {
    fn url(&self) -> &str {
        "http://fake-comfyui"
    }

    async fn probe(&self) -> Result<(), ComfyUIApiError> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst);
        if n < self.probe_failures {
            return Err(ComfyUIApiError::ApiError {
                status: 503,
                body: "starting".into(),
            });
        }
        Ok(())
    }

    async fn submit(&self, graph: &WorkflowGraph) -> Result<SubmitResponse, ComfyUIApiError> {
        self.submitted.lock().unwrap().push(graph.to_value());
        if let Some(body) = &self.reject_with {
            return Err(ComfyUIApiError::ApiError {
                status: 400,
                body: body.to_string(),
            });
        }
        Ok(SubmitResponse {
            prompt_id: PROMPT_ID.to_string(),
            number: 1,
            node_errors: json!({}),
        })
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let body = {
            let mut bodies = self.history.lock().unwrap();
            if bodies.len() > 1 {
                bodies.remove(0)
            } else {
                bodies[0].clone()
            }
        };
        Ok(parse_history(prompt_id, &body)?)
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        self.fetched.lock().unwrap().push(image.clone());
        self.images
            .get(&image.filename)
            .cloned()
            .ok_or_else(|| ComfyUIApiError::ApiError {
                status: 404,
                body: format!("{} not found", image.filename),
            })
    }
}
