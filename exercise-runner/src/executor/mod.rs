//! Task executors.
//!
//! Agents turn each command into a natural-language task and hand it to a
//! [`TaskExecutor`]. The executor is an external collaborator: the exercise
//! only relies on it being async, bounded by a timeout, and reporting an
//! explicit [`TaskOutcome`].

pub mod http;
pub mod simulated;

pub use http::HttpExecutor;
pub use simulated::SimulatedExecutor;

use crate::settings::{ExecutorConfig, ExecutorKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Result of one task execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { result: String },
    Failure { error: String },
}

impl TaskOutcome {
    pub fn success(result: impl Into<String>) -> Self {
        TaskOutcome::Success {
            result: result.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

/// Executes agent tasks.
///
/// Implementations never return errors: transport problems, refusals and
/// bad input all come back as [`TaskOutcome::Failure`].
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Run one task. `context` carries who is asking and why.
    async fn execute(&self, task: &str, context: Option<&Value>) -> TaskOutcome;
}

/// Run `task` on `executor`, turning an elapsed `limit` into a failure.
pub async fn execute_with_timeout(
    executor: &dyn TaskExecutor,
    task: &str,
    context: Option<&Value>,
    limit: Duration,
) -> TaskOutcome {
    match tokio::time::timeout(limit, executor.execute(task, context)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                executor = executor.name(),
                timeout_ms = limit.as_millis() as u64,
                "Task execution timed out"
            );
            TaskOutcome::failure(format!(
                "Task timed out after {:.1}s",
                limit.as_secs_f64()
            ))
        }
    }
}

/// Build the executor selected by configuration.
pub fn build_executor(config: &ExecutorConfig) -> Result<Arc<dyn TaskExecutor>> {
    match config.kind {
        ExecutorKind::Simulated => Ok(Arc::new(SimulatedExecutor::new(Duration::from_millis(
            config.latency_ms,
        )))),
        ExecutorKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .context("executor.endpoint is required for the http executor")?;
            Ok(Arc::new(HttpExecutor::new(endpoint)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _task: &str, _context: Option<&Value>) -> TaskOutcome {
            tokio::time::sleep(Duration::from_secs(10)).await;
            TaskOutcome::success("too late")
        }
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure() {
        let outcome = execute_with_timeout(
            &SlowExecutor,
            "scan the perimeter",
            None,
            Duration::from_millis(50),
        )
        .await;

        match outcome {
            TaskOutcome::Failure { error } => assert!(error.contains("timed out")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fast_task_passes_through() {
        let executor = SimulatedExecutor::new(Duration::ZERO);
        let outcome =
            execute_with_timeout(&executor, "map the network", None, Duration::from_secs(1)).await;
        assert!(outcome.is_success());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(TaskOutcome::failure("boom")).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_build_executor_requires_endpoint_for_http() {
        let config = ExecutorConfig {
            kind: ExecutorKind::Http,
            endpoint: None,
            latency_ms: 0,
        };
        assert!(build_executor(&config).is_err());

        let config = ExecutorConfig {
            kind: ExecutorKind::Http,
            endpoint: Some("http://127.0.0.1:9000/execute".to_string()),
            latency_ms: 0,
        };
        assert_eq!(build_executor(&config).unwrap().name(), "http");
    }

    #[test]
    fn test_build_simulated_executor_by_default() {
        let executor = build_executor(&ExecutorConfig::default()).unwrap();
        assert_eq!(executor.name(), "simulated");
    }
}
