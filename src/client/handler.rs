use super::BrokerClient;
use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Callback for inbound messages of one [`MessageType`](crate::message::MessageType).
///
/// Handlers run one at a time on the client's dispatch task, in arrival
/// order, so a slow handler delays later messages but never response
/// correlation. The client is passed in so a handler can reply without
/// keeping its own reference.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, client: &BrokerClient, message: Message);
}

/// Handler that forwards every message into a channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, _client: &BrokerClient, message: Message) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(message);
    }
}
