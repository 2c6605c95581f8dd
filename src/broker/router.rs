use super::connection;
use super::Broker;
use crate::message::protocol::close_code;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;

/// Create the broker's WebSocket router.
///
/// Agents connect on `/ws/:agent_id`. Any other path is still upgraded so
/// the peer receives a protocol-level close (1003) instead of an HTTP error.
pub fn create_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ws/:agent_id", get(agent_socket))
        .fallback(invalid_path)
        .with_state(broker)
}

async fn agent_socket(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    State(broker): State<Arc<Broker>>,
) -> Response {
    ws.on_upgrade(move |socket| connection::serve(broker, agent_id, socket))
}

async fn invalid_path(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| connection::reject(socket, close_code::INVALID_PATH, "Invalid path"))
}
