//! ComfyUI workflow graphs.
//!
//! The engine accepts graphs in "API format": an object keyed by node ID
//! where each value carries a `class_type` and an `inputs` map. Inputs
//! are either literal values or `[source_node_id, output_slot]`
//! references to another node's output.
//!
//! The ComfyUI editor exports a different "UI format" (`nodes` and
//! `links` arrays). [`WorkflowGraph::from_any`] accepts both and converts
//! the latter into API format.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// UI-format conversion tables
// ---------------------------------------------------------------------------

/// Positional widget names per node class, in `widgets_values` order.
const WIDGET_LAYOUTS: &[(&str, &[&str])] = &[
    ("CLIPTextEncode", &["text"]),
    ("EmptyLatentImage", &["width", "height", "batch_size"]),
    ("EmptySD3LatentImage", &["width", "height", "batch_size"]),
    ("RandomNoise", &["noise_seed", "control_after_generate"]),
    ("FluxGuidance", &["guidance"]),
    ("BasicScheduler", &["scheduler", "steps", "denoise"]),
    ("KSamplerSelect", &["sampler_name"]),
    (
        "KSampler",
        &[
            "seed",
            "control_after_generate",
            "steps",
            "cfg",
            "sampler_name",
            "scheduler",
            "denoise",
        ],
    ),
    ("LoadImage", &["image", "upload"]),
    ("SaveImage", &["filename_prefix"]),
    ("CheckpointLoaderSimple", &["ckpt_name"]),
    ("VAELoader", &["vae_name"]),
    ("UNETLoader", &["unet_name", "weight_dtype"]),
    ("DualCLIPLoader", &["clip_name1", "clip_name2", "type"]),
    ("LoraLoader", &["lora_name", "strength_model", "strength_clip"]),
];

/// Widgets that only exist in the editor and are never sent to the engine.
const EDITOR_ONLY_WIDGETS: &[&str] = &["control_after_generate", "upload"];

/// Annotation node classes that the engine does not know about.
const EDITOR_ONLY_CLASSES: &[&str] = &["Note", "MarkdownNote"];

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A single node of an API-format workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowNode {
    /// ComfyUI class type (e.g. "KSampler", "CLIPTextEncode").
    pub class_type: String,
    /// Input name -> literal value or `[node_id, slot]` reference.
    pub inputs: Map<String, Value>,
    /// Any other keys on the node (e.g. `_meta`), passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A reference from one node's input to another node's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConnection {
    pub from_node: String,
    pub from_output: u64,
    pub to_node: String,
    pub to_input: String,
}

/// An API-format workflow graph keyed by node ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowGraph {
    /// Parse an API-format workflow.
    ///
    /// ```json
    /// {
    ///   "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "...", "clip": ["11", 0] } }
    /// }
    /// ```
    pub fn from_value(json: &Value) -> Result<Self, CoreError> {
        let obj = json
            .as_object()
            .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;

        if obj.is_empty() {
            return Err(CoreError::Validation(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }

        let mut nodes = BTreeMap::new();
        for (node_id, node_value) in obj {
            let node_obj = node_value.as_object().ok_or_else(|| {
                CoreError::Validation(format!("Node '{node_id}' must be an object"))
            })?;

            let class_type = node_obj
                .get("class_type")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CoreError::Validation(format!(
                        "Node '{node_id}' is missing required 'class_type' field"
                    ))
                })?
                .to_string();

            let inputs = match node_obj.get("inputs") {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(CoreError::Validation(format!(
                        "Node '{node_id}' has a non-object 'inputs' field"
                    )))
                }
            };

            let extra = node_obj
                .iter()
                .filter(|(key, _)| key.as_str() != "class_type" && key.as_str() != "inputs")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            nodes.insert(
                node_id.clone(),
                WorkflowNode {
                    class_type,
                    inputs,
                    extra,
                },
            );
        }

        Ok(Self { nodes })
    }

    /// Convert an editor-exported (UI format) workflow into API format.
    ///
    /// Linked inputs become `[source_node_id, slot]` references. Widget
    /// values are mapped to named inputs for the node classes listed in
    /// the widget layout table; widgets of other classes are dropped.
    /// A widget never overrides an input that is already linked.
    pub fn from_ui_format(json: &Value) -> Result<Self, CoreError> {
        let ui_nodes = json.get("nodes").and_then(Value::as_array).ok_or_else(|| {
            CoreError::Validation("UI workflow must contain a 'nodes' array".to_string())
        })?;

        let links = collect_links(json.get("links"))?;
        let mut nodes = BTreeMap::new();

        for ui_node in ui_nodes {
            let node_id = id_string(ui_node.get("id")).ok_or_else(|| {
                CoreError::Validation("UI workflow node is missing an 'id'".to_string())
            })?;
            let class_type = ui_node.get("type").and_then(Value::as_str).ok_or_else(|| {
                CoreError::Validation(format!("UI workflow node '{node_id}' is missing 'type'"))
            })?;

            if EDITOR_ONLY_CLASSES.contains(&class_type) {
                continue;
            }

            let mut inputs = Map::new();
            if let Some(slots) = ui_node.get("inputs").and_then(Value::as_array) {
                for slot in slots {
                    let Some(name) = slot.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let reference = slot
                        .get("link")
                        .and_then(Value::as_i64)
                        .and_then(|link_id| links.get(&link_id));
                    if let Some(reference) = reference {
                        inputs.insert(name.to_string(), reference.clone());
                    }
                }
            }

            if let Some(values) = ui_node.get("widgets_values").and_then(Value::as_array) {
                apply_widget_values(class_type, values, &mut inputs);
            }

            nodes.insert(
                node_id,
                WorkflowNode {
                    class_type: class_type.to_string(),
                    inputs,
                    extra: Map::new(),
                },
            );
        }

        if nodes.is_empty() {
            return Err(CoreError::Validation(
                "UI workflow contains no executable nodes".to_string(),
            ));
        }

        Ok(Self { nodes })
    }

    /// Parse a workflow in either API or UI format.
    pub fn from_any(json: &Value) -> Result<Self, CoreError> {
        if json.get("nodes").is_some_and(Value::is_array) {
            Self::from_ui_format(json)
        } else {
            Self::from_value(json)
        }
    }

    /// Read a bundled workflow file from disk (API or UI format).
    pub fn load_bundled(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let json: Value = serde_json::from_str(&content).map_err(|e| {
            CoreError::Validation(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        Self::from_any(&json)
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(node_id)
    }

    /// Nodes in ascending node-ID order.
    pub fn nodes(&self) -> impl Iterator<Item = (&String, &WorkflowNode)> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&String, &mut WorkflowNode)> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All input references between nodes.
    pub fn connections(&self) -> Vec<NodeConnection> {
        let mut connections = Vec::new();
        for (node_id, node) in &self.nodes {
            for (input_name, value) in &node.inputs {
                if let Some((from_node, from_output)) = as_link(value) {
                    connections.push(NodeConnection {
                        from_node,
                        from_output,
                        to_node: node_id.clone(),
                        to_input: input_name.clone(),
                    });
                }
            }
        }
        connections
    }

    /// References whose source node does not exist in the graph.
    pub fn dangling_references(&self) -> Vec<NodeConnection> {
        self.connections()
            .into_iter()
            .filter(|c| !self.nodes.contains_key(&c.from_node))
            .collect()
    }

    /// Render the graph as the JSON object the engine expects.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::with_capacity(self.nodes.len());
        for (node_id, node) in &self.nodes {
            let mut node_obj = node.extra.clone();
            node_obj.insert("class_type".to_string(), json!(node.class_type));
            node_obj.insert("inputs".to_string(), Value::Object(node.inputs.clone()));
            obj.insert(node_id.clone(), Value::Object(node_obj));
        }
        Value::Object(obj)
    }
}

/// Interpret an input value as a `[source_node_id, output_slot]` reference.
///
/// The engine accepts the source ID as either a string or a number.
pub fn as_link(value: &Value) -> Option<(String, u64)> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let from_node = match &arr[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => return None,
    };
    let slot = arr[1].as_u64()?;
    Some((from_node, slot))
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Build `link_id -> [source_node_id, source_slot]` from a UI `links` array.
///
/// Links are either positional arrays
/// `[link_id, source_node, source_slot, target_node, target_slot, type]`
/// or objects with `id`, `origin_id` and `origin_slot` keys.
fn collect_links(links: Option<&Value>) -> Result<HashMap<i64, Value>, CoreError> {
    let mut map = HashMap::new();
    let Some(entries) = links.and_then(Value::as_array) else {
        return Ok(map);
    };

    for entry in entries {
        let (link_id, origin, slot) = match entry {
            Value::Array(fields) if fields.len() >= 3 => (
                fields[0].as_i64(),
                id_string(Some(&fields[1])),
                fields[2].as_i64(),
            ),
            Value::Object(fields) => (
                fields.get("id").and_then(Value::as_i64),
                id_string(fields.get("origin_id")),
                fields.get("origin_slot").and_then(Value::as_i64),
            ),
            _ => (None, None, None),
        };

        match (link_id, origin, slot) {
            (Some(link_id), Some(origin), Some(slot)) => {
                map.insert(link_id, json!([origin, slot]));
            }
            _ => {
                return Err(CoreError::Validation(format!(
                    "Malformed link entry in UI workflow: {entry}"
                )))
            }
        }
    }

    Ok(map)
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn apply_widget_values(class_type: &str, values: &[Value], inputs: &mut Map<String, Value>) {
    let Some((_, layout)) = WIDGET_LAYOUTS.iter().find(|(class, _)| *class == class_type) else {
        return;
    };

    for (name, value) in layout.iter().zip(values) {
        if EDITOR_ONLY_WIDGETS.contains(name) || inputs.contains_key(*name) {
            continue;
        }
        inputs.insert((*name).to_string(), value.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
