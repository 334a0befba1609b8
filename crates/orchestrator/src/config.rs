use std::time::Duration;

use crate::backoff::RetryPolicy;

/// Orchestrator tuning, loaded once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Backoff applied to submits that fail transiently.
    pub submit_retry: RetryPolicy,
    /// How long shutdown waits for lifecycle workers to stop.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            submit_retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl OrchestratorConfig {
    /// Load orchestrator configuration from environment variables.
    ///
    /// | Env Var                      | Default |
    /// |------------------------------|---------|
    /// | `SUBMIT_MAX_ATTEMPTS`        | `4`     |
    /// | `SUBMIT_BACKOFF_INITIAL_MS`  | `500`   |
    /// | `SUBMIT_BACKOFF_MAX_MS`      | `8000`  |
    /// | `SHUTDOWN_GRACE_SECS`        | `10`    |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_attempts: u32 = std::env::var("SUBMIT_MAX_ATTEMPTS")
            .unwrap_or_else(|_| defaults.submit_retry.max_attempts.to_string())
            .parse()
            .expect("SUBMIT_MAX_ATTEMPTS must be a valid u32");

        let initial_ms: u64 = std::env::var("SUBMIT_BACKOFF_INITIAL_MS")
            .unwrap_or_else(|_| "500".into())
            .parse()
            .expect("SUBMIT_BACKOFF_INITIAL_MS must be a valid u64");

        let max_ms: u64 = std::env::var("SUBMIT_BACKOFF_MAX_MS")
            .unwrap_or_else(|_| "8000".into())
            .parse()
            .expect("SUBMIT_BACKOFF_MAX_MS must be a valid u64");

        let shutdown_grace_secs: u64 = std::env::var("SHUTDOWN_GRACE_SECS")
            .unwrap_or_else(|_| "10".into())
            .parse()
            .expect("SHUTDOWN_GRACE_SECS must be a valid u64");

        Self {
            submit_retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms.max(initial_ms)),
                multiplier: defaults.submit_retry.multiplier,
            },
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
        }
    }
}
