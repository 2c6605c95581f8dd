// Shared helpers for integration tests that run real brokers on
// ephemeral ports and talk to them over real WebSockets.

#![allow(dead_code)]

use cyber_range::broker::{Broker, BrokerSettings};
use cyber_range::client::{BrokerClient, ChannelHandler, ClientSettings};
use cyber_range::config::ClientConfig;
use cyber_range::message::protocol::{self, ControlMessage, Frame, ServerControl};
use cyber_range::message::{Message, MessageType};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(300);

pub async fn start_broker(max_connections: usize) -> Arc<Broker> {
    let broker = Arc::new(Broker::new(BrokerSettings {
        name: "test".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        max_connections,
        sweep_interval: Duration::from_secs(30),
        stale_timeout: Duration::from_secs(120),
    }));
    broker.start().await.unwrap();
    broker
}

pub fn fast_policy() -> ClientConfig {
    ClientConfig {
        reconnect_interval_ms: 50,
        max_reconnect_attempts: 3,
        heartbeat_interval_seconds: 30,
        registration_timeout_ms: 2000,
        command_timeout_seconds: 1,
    }
}

/// Start a client whose every inbound message lands in the returned channel.
pub async fn connect_client(
    broker: &Broker,
    agent_id: &str,
) -> (BrokerClient, UnboundedReceiver<Message>) {
    let settings = ClientSettings::new(
        broker.url().unwrap(),
        agent_id,
        "test_agent",
        &fast_policy(),
    );
    let client = BrokerClient::new(settings);

    let (handler, rx) = ChannelHandler::new();
    let handler = Arc::new(handler);
    for message_type in [
        MessageType::Command,
        MessageType::Response,
        MessageType::Alert,
        MessageType::Status,
        MessageType::Error,
    ] {
        client.register_handler(message_type, handler.clone());
    }

    client.start().await.unwrap();
    (client, rx)
}

pub async fn recv(rx: &mut UnboundedReceiver<Message>) -> Message {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

pub async fn assert_quiet(rx: &mut UnboundedReceiver<Message>) {
    if let Ok(Some(message)) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected message: {:?}", message);
    }
}

/// Raw WebSocket to `path` on the broker, no handshake.
pub async fn raw_connect(broker: &Broker, path: &str) -> RawSocket {
    let url = format!("{}{}", broker.url().unwrap(), path);
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

/// Raw connection that has completed registration.
pub async fn raw_register(broker: &Broker, agent_id: &str) -> RawSocket {
    let mut socket = raw_connect(broker, &format!("/ws/{}", agent_id)).await;
    let register = ControlMessage::Register {
        agent_type: "raw".to_string(),
        agent_id: None,
    };
    socket
        .send(WsMessage::Text(serde_json::to_string(&register).unwrap()))
        .await
        .unwrap();

    loop {
        let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        if let WsMessage::Text(text) = frame {
            if let Ok(Frame::Control(ServerControl::RegistrationConfirmed { .. })) =
                protocol::parse_broker_frame(&text)
            {
                return socket;
            }
        }
    }
}

/// Read until the broker closes the socket; returns the close code.
pub async fn close_code(socket: &mut RawSocket) -> Option<u16> {
    loop {
        match timeout(WAIT, socket.next()).await.ok()?? {
            Ok(WsMessage::Close(frame)) => return frame.map(|f| u16::from(f.code)),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Poll until `condition` holds or the wait elapses.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
