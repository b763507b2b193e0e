//! ComfyUI execution history records.
//!
//! `GET /history/{prompt_id}` returns `{}` while the prompt is queued or
//! running, and `{"<prompt_id>": {...}}` once the engine has recorded it.
//! This module deserializes that entry and classifies it into a
//! [`HistoryOutcome`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `status_str` value the engine reports for a failed prompt.
pub const STATUS_ERROR: &str = "error";

/// Location of a produced image, as accepted by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Folder type: `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Per-node output record. Non-image outputs are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// Raw `[event, data]` pairs (execution_start, execution_error, ...).
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// One prompt's entry in the engine history.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    /// The entry as received, kept for error diagnostics.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

/// An image together with the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputImage {
    pub node_id: String,
    pub image: ImageRef,
}

/// Classification of a history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// Recorded but not finished yet.
    Pending,
    /// The engine reported `status_str == "error"`.
    Failed,
    /// At least one node produced images, in node-ID order.
    Completed(Vec<OutputImage>),
    /// The engine finished without any image output.
    NoImages,
}

impl HistoryEntry {
    /// Classify this entry. An error status wins over any outputs.
    pub fn outcome(&self) -> HistoryOutcome {
        if self.is_error() {
            return HistoryOutcome::Failed;
        }

        let images = self.output_images();
        if !images.is_empty() {
            return HistoryOutcome::Completed(images);
        }

        if self.status.as_ref().is_some_and(|s| s.completed) {
            HistoryOutcome::NoImages
        } else {
            HistoryOutcome::Pending
        }
    }

    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .is_some_and(|s| s == STATUS_ERROR)
    }

    /// Every image across all output nodes.
    pub fn output_images(&self) -> Vec<OutputImage> {
        self.outputs
            .iter()
            .flat_map(|(node_id, output)| {
                output.images.iter().map(move |image| OutputImage {
                    node_id: node_id.clone(),
                    image: image.clone(),
                })
            })
            .collect()
    }
}

/// Extract the entry for `prompt_id` from a `/history/{prompt_id}` body.
///
/// Returns `Ok(None)` while the engine has no record of the prompt.
pub fn parse_history(
    prompt_id: &str,
    body: &serde_json::Value,
) -> Result<Option<HistoryEntry>, serde_json::Error> {
    let Some(raw) = body.get(prompt_id) else {
        return Ok(None);
    };
    let mut entry = HistoryEntry::deserialize(raw)?;
    entry.raw = raw.clone();
    Ok(Some(entry))
}
