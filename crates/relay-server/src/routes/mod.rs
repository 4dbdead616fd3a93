pub mod proxy;
pub mod public_ws;
pub mod tunnel;

use axum::extract::ws::{CloseFrame, Message, WebSocket};

/// Close a socket with an explicit code and reason. Errors are ignored: the
/// peer may already be gone.
pub(crate) async fn close_socket(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
