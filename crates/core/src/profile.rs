//! Workflow profiles.
//!
//! Each profile is a thin configuration for one kind of job: where the
//! graph comes from, which node inputs receive the typed generation
//! parameters, and the defaults for those parameters. Profiles do not
//! share a schema beyond this; node IDs are specific to each graph.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::CoreError;
use crate::job::GenerationParams;
use crate::patch::PatchSet;
use crate::workflow::WorkflowGraph;

pub const FLUX_PULID_PROFILE: &str = "flux-pulid";
pub const API_WORKFLOW_PROFILE: &str = "api-workflow";

/// Names accepted by [`WorkflowProfile::builtin`].
pub const BUILTIN_PROFILES: &[&str] = &[FLUX_PULID_PROFILE, API_WORKFLOW_PROFILE];

/// Where a profile's workflow graph comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphSource {
    /// A file under the configured workflow directory. A caller-supplied
    /// graph still takes precedence.
    Bundled { file: String },
    /// The caller must supply the graph in the job input.
    CallerSupplied,
}

/// Typed generation parameters a profile can bind to node inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    Prompt,
    Width,
    Height,
    Seed,
    Guidance,
    Steps,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTarget {
    pub node_id: String,
    pub input: String,
}

impl NodeTarget {
    pub fn new(node_id: &str, input: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            input: input.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProfile {
    pub name: String,
    pub graph: GraphSource,
    /// Parameter -> node inputs that receive it. Unbound parameters are
    /// not written into the graph.
    #[serde(default)]
    pub bindings: BTreeMap<Param, Vec<NodeTarget>>,
    #[serde(default)]
    pub defaults: GenerationParams,
}

impl WorkflowProfile {
    /// Look up a profile shipped with the worker.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            FLUX_PULID_PROFILE => Some(Self::flux_pulid()),
            API_WORKFLOW_PROFILE => Some(Self::api_workflow()),
            _ => None,
        }
    }

    /// Flux text-to-image with an optional PuLID face reference.
    pub fn flux_pulid() -> Self {
        let bindings = BTreeMap::from([
            (Param::Prompt, vec![NodeTarget::new("6", "text")]),
            (Param::Width, vec![NodeTarget::new("27", "width")]),
            (Param::Height, vec![NodeTarget::new("27", "height")]),
            (Param::Seed, vec![NodeTarget::new("25", "noise_seed")]),
            (Param::Guidance, vec![NodeTarget::new("26", "guidance")]),
            (Param::Steps, vec![NodeTarget::new("17", "steps")]),
            (Param::Image, vec![NodeTarget::new("54", "image")]),
        ]);

        Self {
            name: FLUX_PULID_PROFILE.to_string(),
            graph: GraphSource::Bundled {
                file: "character_model_possesV1.json".to_string(),
            },
            bindings,
            defaults: GenerationParams::default(),
        }
    }

    /// Arbitrary caller-supplied graph, patched only via `modifications`.
    pub fn api_workflow() -> Self {
        Self {
            name: API_WORKFLOW_PROFILE.to_string(),
            graph: GraphSource::CallerSupplied,
            bindings: BTreeMap::new(),
            defaults: GenerationParams::default(),
        }
    }

    /// Load a profile definition from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CoreError::Validation(format!("Invalid profile {}: {e}", path.display()))
        })
    }

    pub fn requires_caller_graph(&self) -> bool {
        self.graph == GraphSource::CallerSupplied
    }

    pub fn targets(&self, param: Param) -> &[NodeTarget] {
        self.bindings.get(&param).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Turn resolved parameters into patches for every bound target.
    ///
    /// `image_file` is the staged filename of the caller's primary
    /// reference image; without one the image binding is left alone.
    pub fn binding_patches(&self, params: &GenerationParams, image_file: Option<&str>) -> PatchSet {
        let mut patches = PatchSet::new();

        for (param, targets) in &self.bindings {
            let value = match param {
                Param::Prompt => json!(params.prompt),
                Param::Width => json!(params.width),
                Param::Height => json!(params.height),
                Param::Seed => json!(params.seed),
                Param::Guidance => json!(params.guidance),
                Param::Steps => json!(params.steps),
                Param::Image => match image_file {
                    Some(file) => json!(file),
                    None => continue,
                },
            };
            for target in targets {
                patches.set(target.node_id.clone(), target.input.clone(), value.clone());
            }
        }

        patches
    }

    /// The parameters as they ended up in `graph`.
    ///
    /// Each bound parameter is read from its first target. Targets that
    /// are missing or hold a value of the wrong type keep the resolved
    /// value from `params`.
    pub fn params_in_graph(&self, graph: &WorkflowGraph, params: &GenerationParams) -> GenerationParams {
        let mut effective = params.clone();

        for (param, targets) in &self.bindings {
            let Some(value) = targets
                .first()
                .and_then(|t| graph.node(&t.node_id)?.inputs.get(&t.input))
            else {
                continue;
            };
            let as_u32 = || value.as_u64().and_then(|n| u32::try_from(n).ok());

            match param {
                Param::Prompt => {
                    if let Some(prompt) = value.as_str() {
                        effective.prompt = prompt.to_string();
                    }
                }
                Param::Seed => {
                    if let Some(seed) = value.as_i64() {
                        effective.seed = seed;
                    }
                }
                Param::Guidance => {
                    if let Some(guidance) = value.as_f64() {
                        effective.guidance = guidance;
                    }
                }
                Param::Steps => effective.steps = as_u32().unwrap_or(effective.steps),
                Param::Width => effective.width = as_u32().unwrap_or(effective.width),
                Param::Height => effective.height = as_u32().unwrap_or(effective.height),
                Param::Image => {}
            }
        }

        effective
    }
}
