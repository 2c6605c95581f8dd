use super::{TaskExecutor, TaskOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    task: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a Value>,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    result: String,
    #[serde(default)]
    error: Option<String>,
}

/// Executor backed by a remote service.
///
/// POSTs `{task, context}` as JSON to the configured endpoint and expects
/// `{success, result, error?}` back.
pub struct HttpExecutor {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, task: &str, context: Option<&Value>) -> Result<ExecuteResponse> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&ExecuteRequest { task, context })
            .send()
            .await
            .context("Failed to reach task executor")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            anyhow::bail!("Task executor returned status {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse task executor response")
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, task: &str, context: Option<&Value>) -> TaskOutcome {
        match self.request(task, context).await {
            Ok(response) if response.success => {
                debug!(endpoint = %self.endpoint, "Task executed");
                TaskOutcome::success(response.result)
            }
            Ok(response) => TaskOutcome::failure(
                response
                    .error
                    .unwrap_or_else(|| "Task executor reported failure".to_string()),
            ),
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Task execution failed");
                TaskOutcome::failure(format!("{:#}", e))
            }
        }
    }
}
