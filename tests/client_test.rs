// Client behaviour against a real broker: handshake, request/response
// correlation, timeouts, delivery order, reconnects and connection failure.

mod common;

use async_trait::async_trait;
use common::*;
use cyber_range::client::{BrokerClient, ClientError, ClientSettings, MessageHandler};
use cyber_range::message::{into_payload, Message, MessageType};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Answers every command with its own parameters echoed back.
struct EchoResponder;

#[async_trait]
impl MessageHandler for EchoResponder {
    async fn handle(&self, client: &BrokerClient, message: Message) {
        let mut content = message.content().clone();
        content.insert("success".to_string(), json!(true));
        let reply = message.reply(client.agent_id(), content);
        client.send_message(reply).unwrap();
    }
}

#[tokio::test]
async fn test_command_resolves_with_matching_response() {
    let broker = start_broker(10).await;
    let (requester, mut requester_rx) = connect_client(&broker, "coordinator").await;

    let responder = BrokerClient::new(ClientSettings::new(
        broker.url().unwrap(),
        "recon_agent",
        "red_team_recon",
        &fast_policy(),
    ));
    responder.register_handler(MessageType::Command, Arc::new(EchoResponder));
    responder.start().await.unwrap();

    let response = requester
        .send_command_and_wait(
            "recon_agent",
            into_payload(json!({"type": "osint_gathering"})),
            Duration::from_secs(3),
        )
        .await
        .unwrap()
        .expect("expected a response");

    assert_eq!(response.message_type(), MessageType::Response);
    assert_eq!(response.sender_id(), "recon_agent");
    assert_eq!(response.content_str("type"), Some("osint_gathering"));
    assert_eq!(response.content().get("success"), Some(&json!(true)));
    assert_eq!(requester.pending_count(), 0);

    // Correlated responses do not reach the general handlers
    assert_quiet(&mut requester_rx).await;

    responder.stop().await;
    requester.stop().await;
    broker.stop();
}

#[tokio::test]
async fn test_no_response_resolves_none_after_timeout() {
    let broker = start_broker(10).await;
    let (requester, _requester_rx) = connect_client(&broker, "coordinator").await;
    let (_silent, mut silent_rx) = connect_client(&broker, "silent").await;

    let wait = Duration::from_millis(400);
    let started = Instant::now();
    let response = requester
        .send_command_and_wait("silent", into_payload(json!({})), wait)
        .await
        .unwrap();

    assert!(response.is_none());
    assert!(started.elapsed() >= wait);
    assert!(started.elapsed() < wait + Duration::from_secs(2));
    assert_eq!(requester.pending_count(), 0);

    // The command itself was delivered and flagged
    let command = recv(&mut silent_rx).await;
    assert!(command.requires_response());

    broker.stop();
}

#[tokio::test]
async fn test_disconnect_fails_pending_requests_early() {
    let broker = start_broker(10).await;
    let (requester, _requester_rx) = connect_client(&broker, "coordinator").await;
    let (_silent, _silent_rx) = connect_client(&broker, "silent").await;

    let waiter = {
        let requester = requester.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let response = requester
                .send_command_and_wait("silent", into_payload(json!({})), Duration::from_secs(10))
                .await
                .unwrap();
            (response, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    broker.stop();

    let (response, elapsed) = waiter.await.unwrap();
    assert!(response.is_none());
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_send_after_stop_is_not_connected() {
    let broker = start_broker(10).await;
    let (client, _rx) = connect_client(&broker, "alice").await;
    assert!(client.is_connected());

    client.stop().await;
    client.stop().await;

    assert!(!client.is_connected());
    let err = client
        .send_message(Message::command("alice", "bob", into_payload(json!({}))))
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));

    broker.stop();
}

#[tokio::test]
async fn test_start_gives_up_after_max_attempts() {
    // Grab a free port, then release it so nothing is listening
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = BrokerClient::new(ClientSettings::new(
        format!("ws://127.0.0.1:{}", port),
        "lonely",
        "test_agent",
        &fast_policy(),
    ));

    match client.start().await {
        Err(ClientError::ConnectFailed { attempts, url, .. }) => {
            assert_eq!(attempts, 3);
            assert!(url.ends_with("/ws/lonely"));
        }
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let broker = start_broker(10).await;
    let (client, _rx) = connect_client(&broker, "alice").await;

    assert!(matches!(
        client.start().await,
        Err(ClientError::AlreadyStarted)
    ));

    client.stop().await;
    broker.stop();
}

#[tokio::test]
async fn test_statistics_track_traffic() {
    let broker = start_broker(10).await;
    let (alice, _alice_rx) = connect_client(&broker, "alice").await;
    let (_bob, mut bob_rx) = connect_client(&broker, "bob").await;

    alice
        .send_message(Message::command("alice", "bob", into_payload(json!({}))))
        .unwrap();
    recv(&mut bob_rx).await;
    alice.ping().unwrap();

    let stats = alice.statistics();
    assert_eq!(stats.agent_id, "alice");
    assert!(stats.is_connected);
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.reconnect_count, 0);
    assert!(stats.connection_time.is_some());
    assert_eq!(stats.registered_handlers.len(), 5);
    assert!(stats.registered_handlers.contains(&"command".to_string()));

    broker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handlers_see_messages_in_send_order() {
    let broker = start_broker(10).await;
    let (alice, _alice_rx) = connect_client(&broker, "alice").await;
    let (_bob, mut bob_rx) = connect_client(&broker, "bob").await;

    const COUNT: u64 = 2000;
    for seq in 0..COUNT {
        alice
            .send_message(Message::command("alice", "bob", into_payload(json!({"seq": seq}))))
            .unwrap();
    }

    let mut received = Vec::with_capacity(COUNT as usize);
    for _ in 0..COUNT {
        let message = recv(&mut bob_rx).await;
        received.push(message.content().get("seq").and_then(|v| v.as_u64()).unwrap());
    }
    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());

    broker.stop();
}

#[tokio::test]
async fn test_client_reconnects_after_eviction() {
    let broker = start_broker(10).await;
    let (alice, _alice_rx) = connect_client(&broker, "alice").await;
    let (bob, mut bob_rx) = connect_client(&broker, "bob").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let evicted = broker.evict_stale(Duration::from_millis(10));
    assert!(evicted.contains(&"alice".to_string()));

    // Both were idle, so both come back on their own
    for client in [&alice, &bob] {
        assert!(
            eventually(|| client.statistics().reconnect_count == 1
                && client.is_connected()
                && broker.is_connected(client.agent_id()))
            .await,
            "{} did not reconnect",
            client.agent_id()
        );
    }

    alice
        .send_message(Message::command("alice", "bob", into_payload(json!({"after": "reconnect"}))))
        .unwrap();
    let message = recv(&mut bob_rx).await;
    assert_eq!(message.sender_id(), "alice");
    assert_eq!(message.content_str("after"), Some("reconnect"));

    alice.stop().await;
    bob.stop().await;
    broker.stop();
}
