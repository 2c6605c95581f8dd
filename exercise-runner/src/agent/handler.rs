use super::{commands, AgentCounters, AgentRole, INITIALIZE};
use crate::executor::{execute_with_timeout, TaskExecutor, TaskOutcome};
use async_trait::async_trait;
use cyber_range::client::{BrokerClient, MessageHandler};
use cyber_range::message::{Message, MessageType, Payload};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Answers commands by running them through a task executor.
///
/// Every command gets exactly one `response` back to its sender, carrying
/// the same message id. Unknown commands are answered with a failure.
pub struct CommandHandler {
    role: AgentRole,
    executor: Arc<dyn TaskExecutor>,
    task_timeout: Duration,
    counters: Arc<AgentCounters>,
}

impl CommandHandler {
    pub fn new(
        role: AgentRole,
        executor: Arc<dyn TaskExecutor>,
        task_timeout: Duration,
        counters: Arc<AgentCounters>,
    ) -> Self {
        Self {
            role,
            executor,
            task_timeout,
            counters,
        }
    }

    /// Build the response content for one command.
    pub async fn respond(&self, agent_id: &str, command: &Message) -> Payload {
        let params = command.content();
        let command_type = params.get("type").and_then(Value::as_str).unwrap_or("");
        let team = self.role.team();

        let mut reply = Payload::new();
        reply.insert("command_type".to_string(), json!(command_type));
        reply.insert("agent_id".to_string(), json!(agent_id));
        reply.insert("role".to_string(), json!(self.role.as_str()));
        reply.insert("team".to_string(), json!(team.label()));

        let outcome = if command_type.is_empty() {
            TaskOutcome::failure("Command has no type")
        } else if command_type == INITIALIZE {
            let scenario = params
                .get("scenario")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            TaskOutcome::success(format!(
                "{} agent ready for {}",
                self.role.as_str(),
                scenario
            ))
        } else {
            match commands::find(self.role, command_type) {
                Some(spec) => {
                    reply.insert(team.technique_key().to_string(), json!(spec.technique));
                    if let Some(target) = spec.target(params) {
                        reply.insert("target".to_string(), json!(target));
                    }
                    let task = spec.render(params);
                    let context = json!({
                        "agent_id": agent_id,
                        "role": self.role.as_str(),
                        "team": team.label(),
                        "command_type": command_type,
                    });
                    execute_with_timeout(
                        self.executor.as_ref(),
                        &task,
                        Some(&context),
                        self.task_timeout,
                    )
                    .await
                }
                None => TaskOutcome::failure(format!(
                    "Unsupported command '{}' for {} agent",
                    command_type,
                    self.role.as_str()
                )),
            }
        };

        let success = outcome.is_success();
        self.counters.record(success);
        match outcome {
            TaskOutcome::Success { result } => {
                reply.insert("success".to_string(), json!(true));
                reply.insert("result".to_string(), json!(result));
            }
            TaskOutcome::Failure { error } => {
                reply.insert("success".to_string(), json!(false));
                reply.insert("error".to_string(), json!(error));
            }
        }

        info!(
            agent_id = %agent_id,
            command_type = %command_type,
            success,
            "Command handled"
        );
        reply
    }
}

#[async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(&self, client: &BrokerClient, message: Message) {
        let content = self.respond(client.agent_id(), &message).await;
        let reply = message.reply(client.agent_id(), content);
        if let Err(e) = client.send_message(reply) {
            warn!(
                agent_id = %client.agent_id(),
                command_id = %message.id(),
                error = %e,
                "Failed to send command response"
            );
        }
    }
}

/// Logs status broadcasts and broker errors.
pub struct NoticeHandler;

#[async_trait]
impl MessageHandler for NoticeHandler {
    async fn handle(&self, client: &BrokerClient, message: Message) {
        match message.message_type() {
            MessageType::Error => warn!(
                agent_id = %client.agent_id(),
                error = message.content_str("error").unwrap_or("unknown"),
                "Broker reported an error"
            ),
            _ => debug!(
                agent_id = %client.agent_id(),
                phase = message.content_str("phase").unwrap_or(""),
                "Status update"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;
    use cyber_range::message::{into_payload, COORDINATOR_ID};

    fn handler(role: AgentRole) -> (CommandHandler, Arc<AgentCounters>) {
        let counters = Arc::new(AgentCounters::default());
        let handler = CommandHandler::new(
            role,
            Arc::new(SimulatedExecutor::new(Duration::ZERO)),
            Duration::from_secs(1),
            Arc::clone(&counters),
        );
        (handler, counters)
    }

    fn command(receiver: &str, content: Value) -> Message {
        Message::command(COORDINATOR_ID, receiver, into_payload(content)).expecting_response()
    }

    #[tokio::test]
    async fn test_red_command_reports_technique_and_target() {
        let (handler, _) = handler(AgentRole::LateralMovement);
        let reply = handler
            .respond(
                "lateral_movement_agent_0000beef",
                &command(
                    "lateral_movement_agent_0000beef",
                    json!({
                        "type": "network_traversal",
                        "starting_point": "employee_portal",
                        "target_destination": "scada_system",
                        "network_constraints": "network_segmentation",
                    }),
                ),
            )
            .await;

        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["command_type"], json!("network_traversal"));
        assert_eq!(reply["mitre_technique"], json!("T1021"));
        assert_eq!(reply["target"], json!("scada_system"));
        assert_eq!(reply["team"], json!("red_team"));
        assert_eq!(reply["role"], json!("lateral_movement"));
        assert!(reply["result"]
            .as_str()
            .unwrap()
            .contains("from employee_portal to scada_system"));
        assert!(!reply.contains_key("error"));
    }

    #[tokio::test]
    async fn test_blue_command_reports_capability() {
        let (handler, _) = handler(AgentRole::Detection);
        let reply = handler
            .respond(
                "detection_agent_00000001",
                &command(
                    "detection_agent_00000001",
                    json!({"type": "anomaly_detection", "analysis_type": "statistical"}),
                ),
            )
            .await;

        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["defensive_capability"], json!("detect"));
        assert!(!reply.contains_key("mitre_technique"));
        assert!(!reply.contains_key("target"));
    }

    #[tokio::test]
    async fn test_unknown_command_fails_and_counts() {
        let (handler, counters) = handler(AgentRole::Recon);
        let reply = handler
            .respond(
                "recon_agent_00000001",
                &command("recon_agent_00000001", json!({"type": "containment_strategy"})),
            )
            .await;

        assert_eq!(reply["success"], json!(false));
        assert_eq!(
            reply["error"],
            json!("Unsupported command 'containment_strategy' for recon agent")
        );
        assert_eq!(counters.handled.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(counters.failed.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_missing_type_fails() {
        let (handler, _) = handler(AgentRole::Response);
        let reply = handler
            .respond("response_agent_00000001", &command("x", json!({})))
            .await;
        assert_eq!(reply["success"], json!(false));
        assert_eq!(reply["error"], json!("Command has no type"));
    }

    #[tokio::test]
    async fn test_initialize_is_acknowledged_without_task() {
        let (handler, counters) = handler(AgentRole::ThreatIntel);
        let reply = handler
            .respond(
                "threat_intel_agent_00000001",
                &command(
                    "threat_intel_agent_00000001",
                    json!({"type": "initialize", "scenario": "soci_water_system"}),
                ),
            )
            .await;

        assert_eq!(reply["success"], json!(true));
        assert_eq!(
            reply["result"],
            json!("threat_intel agent ready for soci_water_system")
        );
        assert_eq!(counters.succeeded.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
