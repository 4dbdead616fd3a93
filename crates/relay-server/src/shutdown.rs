//! Shutdown supervisor.
//!
//! Graceful mode notifies every tunnel, gives in-flight requests a bounded
//! drain window, then closes the remaining sessions. Immediate mode closes
//! everything at once; outstanding requests complete with a cancellation,
//! which their HTTP handlers translate to 503.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use relay_proto::{ControlPayload, Envelope};

use crate::close_code;
use crate::registry::OutboundMessage;
use crate::state::AppState;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub async fn graceful(state: Arc<AppState>, drain: Duration) {
    let tunnels = state.registry.tunnels();
    info!(tunnels = tunnels.len(), "Shutting down, notifying active tunnels");
    for tunnel in &tunnels {
        let notice = Envelope::control(relay_proto::new_correlation_id(), ControlPayload::unregister());
        let _ = tunnel.try_send(OutboundMessage::Envelope(notice));
    }

    let deadline = Instant::now() + drain;
    while state.registry.pending_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
    let leftover = state.registry.pending_count();
    if leftover > 0 {
        info!(leftover, "Drain window elapsed with requests still in flight");
    }

    immediate(&state);
}

pub fn immediate(state: &AppState) {
    for tunnel in state.registry.tunnels() {
        let _ = tunnel.try_send(OutboundMessage::Close {
            code: close_code::GOING_AWAY,
            reason: "server shutting down".to_string(),
        });
    }
    state.registry.clear();
    info!("All tunnel sessions closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::registry::{ReplyError, Tunnel};
    use tokio::sync::{mpsc, oneshot};

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(ServerSettings {
            domain: "tun.example.com".to_string(),
            secret_keys: vec!["k1".to_string()],
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn immediate_closes_sessions_and_cancels_pending() {
        let state = test_state();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        state
            .registry
            .register("abc", Arc::new(Tunnel::new("abc", out_tx)));
        let (reply_tx, mut reply_rx) = oneshot::channel();
        state.registry.register_pending("abc", "id-1", reply_tx);

        immediate(&state);

        assert_eq!(state.registry.tunnel_count(), 0);
        assert!(matches!(reply_rx.try_recv().unwrap(), Err(ReplyError::Cancelled)));
        let saw_close = {
            let mut saw = false;
            while let Ok(message) = out_rx.try_recv() {
                if matches!(message, OutboundMessage::Close { code, .. } if code == close_code::GOING_AWAY) {
                    saw = true;
                }
            }
            saw
        };
        assert!(saw_close);
    }

    #[tokio::test]
    async fn graceful_waits_for_pending_then_closes() {
        let state = test_state();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        state
            .registry
            .register("abc", Arc::new(Tunnel::new("abc", out_tx)));
        let (reply_tx, _reply_rx) = oneshot::channel();
        state.registry.register_pending("abc", "id-1", reply_tx);

        let drain_state = state.clone();
        let drain = tokio::spawn(async move {
            graceful(drain_state, Duration::from_secs(5)).await;
        });

        // The pending request completes mid-drain; shutdown then proceeds.
        tokio::time::sleep(Duration::from_millis(150)).await;
        state
            .registry
            .complete_pending_exceptionally("id-1", ReplyError::Cancelled);
        drain.await.unwrap();

        assert_eq!(state.registry.tunnel_count(), 0);
        // First the UNREGISTER notice, then the close.
        assert!(matches!(out_rx.try_recv().unwrap(), OutboundMessage::Envelope(_)));
        assert!(matches!(out_rx.try_recv().unwrap(), OutboundMessage::Close { .. }));
    }
}
