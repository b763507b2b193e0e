use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use podgen_comfyui::poll::PollConfig;
use podgen_comfyui::readiness::ReadinessConfig;
use podgen_core::error::CoreError;
use podgen_core::profile::{WorkflowProfile, BUILTIN_PROFILES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Unknown workflow profile {name:?} (built-in profiles: {builtin})")]
    UnknownProfile { name: String, builtin: String },

    #[error("Failed to load workflow profile: {0}")]
    Profile(#[from] CoreError),
}

/// Worker configuration loaded from environment variables.
///
/// Every field has a default matching the stock serverless image, so an
/// empty environment yields a working configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the ComfyUI HTTP API.
    pub comfy_api_url: String,
    /// Directory ComfyUI reads `LoadImage` files from.
    pub input_dir: PathBuf,
    /// Directory holding bundled workflow graphs.
    pub workflow_dir: PathBuf,
    /// Built-in profile name, or a path to a profile JSON file.
    pub profile: String,
    pub readiness: ReadinessConfig,
    pub poll: PollConfig,
    pub host: String,
    pub port: u16,
    /// When set, process this job file once and exit.
    pub test_input: Option<PathBuf>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var              | Default                 |
    /// |----------------------|-------------------------|
    /// | `COMFY_API_URL`      | `http://127.0.0.1:8188` |
    /// | `COMFY_INPUT_DIR`    | `/comfyui/input`        |
    /// | `WORKFLOW_DIR`       | `/comfyui/workflows`    |
    /// | `WORKER_PROFILE`     | `flux-pulid`            |
    /// | `READY_MAX_ATTEMPTS` | `30`                    |
    /// | `READY_DELAY_MS`     | `2000`                  |
    /// | `POLL_INTERVAL_MS`   | `1000`                  |
    /// | `POLL_TIMEOUT_SECS`  | `300`                   |
    /// | `HOST`               | `0.0.0.0`               |
    /// | `PORT`               | `8000`                  |
    /// | `WORKER_TEST_INPUT`  | unset                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let readiness = ReadinessConfig {
            max_attempts: parse(&lookup, "READY_MAX_ATTEMPTS", 30, "a positive integer")?,
            delay: Duration::from_millis(parse(&lookup, "READY_DELAY_MS", 2000, "a duration in milliseconds")?),
        };
        if readiness.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "READY_MAX_ATTEMPTS",
                value: "0".into(),
                expected: "a positive integer",
            });
        }

        let poll = PollConfig {
            interval: Duration::from_millis(parse(&lookup, "POLL_INTERVAL_MS", 1000, "a duration in milliseconds")?),
            timeout: Duration::from_secs(parse(&lookup, "POLL_TIMEOUT_SECS", 300, "a duration in seconds")?),
        };

        Ok(Self {
            comfy_api_url: var("COMFY_API_URL", "http://127.0.0.1:8188"),
            input_dir: PathBuf::from(var("COMFY_INPUT_DIR", "/comfyui/input")),
            workflow_dir: PathBuf::from(var("WORKFLOW_DIR", "/comfyui/workflows")),
            profile: var("WORKER_PROFILE", podgen_core::profile::FLUX_PULID_PROFILE),
            readiness,
            poll,
            host: var("HOST", "0.0.0.0"),
            port: parse(&lookup, "PORT", 8000, "a valid port number")?,
            test_input: lookup("WORKER_TEST_INPUT")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// Resolve [`profile`](Self::profile) to a built-in profile or, if it
    /// names an existing file, a profile loaded from JSON.
    pub fn resolve_profile(&self) -> Result<WorkflowProfile, ConfigError> {
        if let Some(profile) = WorkflowProfile::builtin(&self.profile) {
            return Ok(profile);
        }

        let path = Path::new(&self.profile);
        if path.is_file() {
            return Ok(WorkflowProfile::from_json_file(path)?);
        }

        Err(ConfigError::UnknownProfile {
            name: self.profile.clone(),
            builtin: BUILTIN_PROFILES.join(", "),
        })
    }
}

fn parse<F, T>(lookup: &F, var: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            value,
            expected,
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use assert_matches::assert_matches;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.comfy_api_url, "http://127.0.0.1:8188");
        assert_eq!(config.input_dir, PathBuf::from("/comfyui/input"));
        assert_eq!(config.workflow_dir, PathBuf::from("/comfyui/workflows"));
        assert_eq!(config.profile, "flux-pulid");
        assert_eq!(config.readiness.max_attempts, 30);
        assert_eq!(config.readiness.delay, Duration::from_secs(2));
        assert_eq!(config.poll.interval, Duration::from_secs(1));
        assert_eq!(config.poll.timeout, Duration::from_secs(300));
        assert_eq!((config.host.as_str(), config.port), ("0.0.0.0", 8000));
        assert!(config.test_input.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("COMFY_API_URL", "http://comfy:8188"),
            ("READY_MAX_ATTEMPTS", "5"),
            ("READY_DELAY_MS", "250"),
            ("POLL_TIMEOUT_SECS", "60"),
            ("PORT", "9000"),
            ("WORKER_TEST_INPUT", "test_input.json"),
        ])
        .unwrap();

        assert_eq!(config.comfy_api_url, "http://comfy:8188");
        assert_eq!(config.readiness.max_attempts, 5);
        assert_eq!(config.readiness.delay, Duration::from_millis(250));
        assert_eq!(config.poll.timeout, Duration::from_secs(60));
        assert_eq!(config.port, 9000);
        assert_eq!(config.test_input, Some(PathBuf::from("test_input.json")));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("PORT", " "), ("WORKER_TEST_INPUT", "")]).unwrap();
        assert_eq!(config.port, 8000);
        assert!(config.test_input.is_none());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        assert_matches!(
            load(&[("POLL_INTERVAL_MS", "soon")]),
            Err(ConfigError::Invalid { var: "POLL_INTERVAL_MS", .. })
        );
        assert_matches!(
            load(&[("PORT", "70000")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        );
        assert_matches!(
            load(&[("READY_MAX_ATTEMPTS", "0")]),
            Err(ConfigError::Invalid { var: "READY_MAX_ATTEMPTS", .. })
        );
    }

    #[test]
    fn builtin_profile_resolves_by_name() {
        let config = load(&[("WORKER_PROFILE", "api-workflow")]).unwrap();
        assert!(config.resolve_profile().unwrap().requires_caller_graph());
    }

    #[test]
    fn profile_file_resolves_by_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name": "custom", "graph": {{"kind": "caller_supplied"}}}}"#
        )
        .unwrap();
        let path = file.path().display().to_string();

        let config = load(&[("WORKER_PROFILE", path.as_str())]).unwrap();
        assert_eq!(config.resolve_profile().unwrap().name, "custom");
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let config = load(&[("WORKER_PROFILE", "does-not-exist")]).unwrap();
        let err = config.resolve_profile().unwrap_err();
        assert_matches!(&err, ConfigError::UnknownProfile { .. });
        assert!(err.to_string().contains("flux-pulid"));
    }
}
