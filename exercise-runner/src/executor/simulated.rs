use super::{TaskExecutor, TaskOutcome};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Offline executor that answers every task with deterministic narrative
/// text after a fixed latency.
pub struct SimulatedExecutor {
    latency: Duration,
}

impl SimulatedExecutor {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn execute(&self, task: &str, context: Option<&Value>) -> TaskOutcome {
        let task = task.trim();
        if task.is_empty() {
            return TaskOutcome::failure("Empty task description");
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let role = context
            .and_then(|c| c.get("role"))
            .and_then(Value::as_str)
            .unwrap_or("analyst");

        TaskOutcome::success(format!(
            "[{}] {}: assessment complete, findings recorded for the exercise debrief.",
            role, task
        ))
    }
}
