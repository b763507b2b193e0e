//! Readiness wait for a freshly started ComfyUI instance.
//!
//! The engine is usually still loading models when the first job
//! arrives. [`wait_until_ready`] probes it a bounded number of times with
//! a fixed delay between attempts and gives up once the budget is spent.

use std::time::Duration;

use crate::engine::ExecutionEngine;

/// Tunable parameters for the readiness wait.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Total number of probes, including the first.
    pub max_attempts: u32,
    /// Delay between consecutive probes.
    pub delay: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            delay: Duration::from_secs(2),
        }
    }
}

impl ReadinessConfig {
    /// Worst-case time spent waiting, ignoring the probes themselves.
    pub fn budget(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("ComfyUI API not reachable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Probe the engine until it answers or the attempt budget is spent.
///
/// Returns the number of attempts it took. No delay follows the final
/// failed attempt.
pub async fn wait_until_ready<E: ExecutionEngine + ?Sized>(
    engine: &E,
    config: &ReadinessConfig,
) -> Result<u32, ReadinessError> {
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match engine.probe().await {
            Ok(()) => {
                tracing::info!(engine_url = engine.url(), attempt, "ComfyUI API is reachable");
                return Ok(attempt);
            }
            Err(e) => {
                tracing::debug!(
                    engine_url = engine.url(),
                    attempt,
                    max_attempts,
                    error = %e,
                    "ComfyUI not ready yet",
                );
                last_error = e.to_string();
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(config.delay).await;
        }
    }

    tracing::warn!(
        engine_url = engine.url(),
        attempts = max_attempts,
        "Giving up waiting for ComfyUI",
    );
    Err(ReadinessError::Exhausted {
        attempts: max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use podgen_core::workflow::WorkflowGraph;

    use crate::api::{ComfyUIApiError, SubmitResponse};
    use crate::history::{HistoryEntry, ImageRef};

    /// Fails the first `failures` probes, then succeeds.
    struct FlakyEngine {
        failures: u32,
        probes: AtomicU32,
    }

    impl FlakyEngine {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                probes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ExecutionEngine for FlakyEngine {
        fn url(&self) -> &str {
            "http://fake"
        }

        async fn probe(&self) -> Result<(), ComfyUIApiError> {
            let n = self.probes.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ComfyUIApiError::ApiError {
                    status: 503,
                    body: "loading".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn submit(&self, _: &WorkflowGraph) -> Result<SubmitResponse, ComfyUIApiError> {
            unreachable!("readiness never submits")
        }

        async fn history(&self, _: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
            unreachable!("readiness never polls")
        }

        async fn fetch_image(&self, _: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
            unreachable!("readiness never fetches")
        }
    }

    fn fast(max_attempts: u32) -> ReadinessConfig {
        ReadinessConfig {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn defaults_match_documented_budget() {
        let config = ReadinessConfig::default();
        assert_eq!(config.max_attempts, 30);
        assert_eq!(config.delay, Duration::from_secs(2));
        assert_eq!(config.budget(), Duration::from_secs(58));
    }

    #[tokio::test]
    async fn ready_on_first_probe() {
        let engine = FlakyEngine::new(0);
        assert_eq!(wait_until_ready(&engine, &fast(5)).await.unwrap(), 1);
        assert_eq!(engine.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_after_retries() {
        let engine = FlakyEngine::new(3);
        assert_eq!(wait_until_ready(&engine, &fast(5)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let engine = FlakyEngine::new(u32::MAX);
        let err = wait_until_ready(&engine, &fast(4)).await.unwrap_err();

        let ReadinessError::Exhausted { attempts, last_error } = err;
        assert_eq!(attempts, 4);
        assert!(last_error.contains("503"));
        assert_eq!(engine.probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_attempts_still_probes_once() {
        let engine = FlakyEngine::new(0);
        assert_eq!(wait_until_ready(&engine, &fast(0)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_sleep_after_final_attempt() {
        let engine = FlakyEngine::new(u32::MAX);
        let config = ReadinessConfig {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        };
        let started = tokio::time::Instant::now();

        assert!(wait_until_ready(&engine, &config).await.is_err());
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }
}
