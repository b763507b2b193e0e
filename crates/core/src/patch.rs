//! Node-input patching.
//!
//! A [`PatchSet`] is an ordered list of `(node_id, input, value)`
//! overwrites. [`apply_patches`] writes them into a [`WorkflowGraph`],
//! checking each one against a [`ParamAllowList`]. Patches that cannot be
//! applied are reported, never fatal.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::workflow::{as_link, WorkflowGraph, WorkflowNode};

/// Inputs that callers may set per built-in node class.
const BUILTIN_ALLOW_LIST: &[(&str, &[&str])] = &[
    ("CLIPTextEncode", &["text"]),
    ("EmptyLatentImage", &["width", "height", "batch_size"]),
    ("EmptySD3LatentImage", &["width", "height", "batch_size"]),
    ("RandomNoise", &["noise_seed"]),
    ("FluxGuidance", &["guidance"]),
    ("BasicScheduler", &["scheduler", "steps", "denoise"]),
    ("KSamplerSelect", &["sampler_name"]),
    (
        "KSampler",
        &["seed", "steps", "cfg", "sampler_name", "scheduler", "denoise"],
    ),
    (
        "KSamplerAdvanced",
        &["noise_seed", "steps", "cfg", "sampler_name", "scheduler", "start_at_step", "end_at_step"],
    ),
    ("LoadImage", &["image"]),
    ("SaveImage", &["filename_prefix"]),
    ("CheckpointLoaderSimple", &["ckpt_name"]),
    ("LoraLoader", &["lora_name", "strength_model", "strength_clip"]),
];

/// A single overwrite of one node input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodePatch {
    pub node_id: String,
    pub input: String,
    pub value: Value,
}

/// Why a patch was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// The graph has no node with this ID.
    UnknownNode,
    /// The node's class does not permit setting this input.
    NotAllowed { class_type: String },
    /// The value is neither a scalar nor a node reference.
    InvalidValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPatch {
    pub patch: NodePatch,
    pub reason: SkipReason,
}

/// Outcome of [`apply_patches`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatchReport {
    pub applied: Vec<NodePatch>,
    pub skipped: Vec<SkippedPatch>,
}

/// Ordered collection of node-input overwrites.
///
/// Setting the same `(node_id, input)` twice keeps the position of the
/// first entry and the value of the last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSet {
    patches: Vec<NodePatch>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, node_id: impl Into<String>, input: impl Into<String>, value: impl Into<Value>) {
        let node_id = node_id.into();
        let input = input.into();
        let value = value.into();

        match self
            .patches
            .iter_mut()
            .find(|p| p.node_id == node_id && p.input == input)
        {
            Some(existing) => existing.value = value,
            None => self.patches.push(NodePatch {
                node_id,
                input,
                value,
            }),
        }
    }

    /// Layer a caller's `node_id -> {input: value}` map on top.
    pub fn extend_from_modifications(&mut self, modifications: &BTreeMap<String, Map<String, Value>>) {
        for (node_id, inputs) in modifications {
            for (input, value) in inputs {
                self.set(node_id.clone(), input.clone(), value.clone());
            }
        }
    }

    /// Replace string values equal to a key of `names` with the mapped
    /// value. Returns the number of substitutions made.
    pub fn substitute_strings(&mut self, names: &HashMap<String, String>) -> usize {
        let mut count = 0;
        for patch in &mut self.patches {
            if let Value::String(current) = &patch.value {
                if let Some(replacement) = names.get(current) {
                    patch.value = Value::String(replacement.clone());
                    count += 1;
                }
            }
        }
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodePatch> {
        self.patches.iter()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Per-class list of inputs that may be patched.
///
/// Classes on the list accept only their listed inputs. Classes not on
/// the list accept only inputs the node already declares, so a patch can
/// never invent a new input on an unfamiliar node.
#[derive(Debug, Clone)]
pub struct ParamAllowList {
    classes: HashMap<String, HashSet<String>>,
}

impl ParamAllowList {
    /// An allow-list with no class entries.
    pub fn empty() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    /// The allow-list for the stock ComfyUI and Flux nodes.
    pub fn builtin() -> Self {
        BUILTIN_ALLOW_LIST
            .iter()
            .fold(Self::empty(), |list, (class, inputs)| list.allow(class, inputs.iter().copied()))
    }

    /// Add (or extend) the entry for `class_type`.
    pub fn allow<'a>(mut self, class_type: &str, inputs: impl IntoIterator<Item = &'a str>) -> Self {
        self.classes
            .entry(class_type.to_string())
            .or_default()
            .extend(inputs.into_iter().map(str::to_string));
        self
    }

    pub fn permits(&self, node: &WorkflowNode, input: &str) -> bool {
        match self.classes.get(&node.class_type) {
            Some(allowed) => allowed.contains(input),
            None => node.inputs.contains_key(input),
        }
    }
}

impl Default for ParamAllowList {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Whether `value` may be written into a node input: a scalar, `null`, or
/// a `[node_id, slot]` reference.
pub fn is_patchable_value(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
        Value::Array(_) => as_link(value).is_some(),
        Value::Object(_) => false,
    }
}

/// Apply every patch in order, overwriting exactly the targeted input.
pub fn apply_patches(
    graph: &mut WorkflowGraph,
    patches: &PatchSet,
    allow_list: &ParamAllowList,
) -> PatchReport {
    let mut report = PatchReport::default();

    for patch in patches.iter() {
        let reason = match graph.node_mut(&patch.node_id) {
            None => Some(SkipReason::UnknownNode),
            Some(_) if !is_patchable_value(&patch.value) => Some(SkipReason::InvalidValue),
            Some(node) => {
                if allow_list.permits(node, &patch.input) {
                    node.inputs.insert(patch.input.clone(), patch.value.clone());
                    None
                } else {
                    Some(SkipReason::NotAllowed {
                        class_type: node.class_type.clone(),
                    })
                }
            }
        };

        match reason {
            Some(reason) => report.skipped.push(SkippedPatch {
                patch: patch.clone(),
                reason,
            }),
            None => report.applied.push(patch.clone()),
        }
    }

    report
}
