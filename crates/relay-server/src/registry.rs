//! Process-wide tunnel registry: subdomain ownership, the pending-request
//! table, and the per-tunnel external WebSocket proxy sessions.
//!
//! The registry is created once and handed to the endpoints by dependency;
//! nothing in this crate holds it as a global. All maps are DashMaps, so
//! every mutation is an atomic entry operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use relay_proto::{Envelope, ErrorPayload, ResponsePayload, WebSocketFramePayload};

use crate::close_code;

/// Message queued for a tunnel session's single writer task.
#[derive(Debug)]
pub enum OutboundMessage {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

#[derive(Debug, Error)]
#[error("tunnel session closed")]
pub struct SessionClosed;

/// How a pending request terminated, when not with a response.
#[derive(Debug)]
pub enum ReplyError {
    /// The client answered with an ERROR envelope.
    Upstream(ErrorPayload),
    /// The tunnel disappeared before replying.
    Cancelled,
}

pub type Reply = Result<ResponsePayload, ReplyError>;

/// A request forwarded over a tunnel, awaiting its correlated reply.
pub struct PendingRequest {
    pub subdomain: String,
    reply: oneshot::Sender<Reply>,
}

/// An external WebSocket client whose frames are relayed through a tunnel.
///
/// Holds no pointer back to the tunnel; reply routing re-resolves the tunnel
/// by subdomain, which tolerates tunnel replacement.
pub struct ExternalProxySession {
    pub subdomain: String,
    pub correlation_id: String,
    sender: mpsc::Sender<WebSocketFramePayload>,
}

impl ExternalProxySession {
    pub fn new(
        subdomain: impl Into<String>,
        correlation_id: impl Into<String>,
        sender: mpsc::Sender<WebSocketFramePayload>,
    ) -> Self {
        Self {
            subdomain: subdomain.into(),
            correlation_id: correlation_id.into(),
            sender,
        }
    }

    /// Clone of the frame queue feeding the external socket's writer task.
    /// Cloned out so callers never hold a map guard across an await.
    pub fn frame_sender(&self) -> mpsc::Sender<WebSocketFramePayload> {
        self.sender.clone()
    }

    fn close_now(&self, code: u16, reason: &str) {
        let _ = self
            .sender
            .try_send(WebSocketFramePayload::close(Some(code), Some(reason.to_string())));
    }
}

/// The persistent WebSocket connection plus its associated subdomain and
/// per-tunnel state. Owned by the registry; the session handler keeps a
/// non-owning `Arc` for the lifetime of its socket.
pub struct Tunnel {
    pub subdomain: String,
    pub created_at: Instant,
    sender: mpsc::Sender<OutboundMessage>,
    pub ws_proxies: DashMap<String, ExternalProxySession>,
    active: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl Tunnel {
    pub fn new(subdomain: impl Into<String>, sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            subdomain: subdomain.into(),
            created_at: Instant::now(),
            sender,
            ws_proxies: DashMap::new(),
            active: AtomicBool::new(true),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Refresh liveness, e.g. on a heartbeat.
    pub fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen.lock().map(|t| *t).unwrap_or(self.created_at)
    }

    /// Queue a message for the session's writer task. Sends on the socket
    /// itself are serialized by that single task.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), SessionClosed> {
        self.sender.send(message).await.map_err(|_| SessionClosed)
    }

    pub fn try_send(&self, message: OutboundMessage) -> Result<(), SessionClosed> {
        self.sender.try_send(message).map_err(|_| SessionClosed)
    }
}

/// Concurrency-safe store of `subdomain → Tunnel` plus the pending-request
/// table keyed by correlation id.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
    pending: DashMap<String, PendingRequest>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent. Returns false when the subdomain is already taken.
    pub fn register(&self, subdomain: &str, tunnel: Arc<Tunnel>) -> bool {
        match self.tunnels.entry(subdomain.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tunnel);
                true
            }
        }
    }

    /// Idempotent removal. Cancellation of the tunnel's pending requests and
    /// proxy sessions happens after the map removal, so a racing handler that
    /// observed the old tunnel sees a terminal cancellation, never a hang.
    pub fn unregister(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        let (_, tunnel) = self.tunnels.remove(subdomain)?;
        self.teardown(&tunnel, true);
        Some(tunnel)
    }

    /// Session-owned cleanup: removes the mapping only while it still points
    /// at this tunnel, so a replacement that re-claimed the subdomain in the
    /// meantime is left alone (its pendings included).
    pub fn unregister_exact(&self, tunnel: &Arc<Tunnel>) {
        let removed = self
            .tunnels
            .remove_if(&tunnel.subdomain, |_, current| Arc::ptr_eq(current, tunnel))
            .is_some();
        self.teardown(tunnel, removed);
    }

    fn teardown(&self, tunnel: &Arc<Tunnel>, cancel_pending: bool) {
        tunnel.deactivate();
        if cancel_pending {
            self.cancel_pending_for(&tunnel.subdomain);
        }
        for session in tunnel.ws_proxies.iter() {
            session.close_now(close_code::GOING_AWAY, "tunnel closed");
        }
        tunnel.ws_proxies.clear();
    }

    pub fn lookup(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(subdomain).map(|entry| entry.value().clone())
    }

    pub fn has(&self, subdomain: &str) -> bool {
        self.tunnels.contains_key(subdomain)
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Returns false on a duplicate correlation id.
    pub fn register_pending(
        &self,
        subdomain: &str,
        correlation_id: &str,
        reply: oneshot::Sender<Reply>,
    ) -> bool {
        match self.pending.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    subdomain: subdomain.to_string(),
                    reply,
                });
                true
            }
        }
    }

    /// Complete a pending request with a response. First writer wins: the
    /// entry is atomically removed, so later completers observe a no-op.
    pub fn complete_pending(&self, correlation_id: &str, response: ResponsePayload) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, pending)) => {
                if pending.reply.send(Ok(response)).is_err() {
                    debug!(%correlation_id, "Requester gone before response arrived");
                }
                true
            }
            None => {
                debug!(%correlation_id, "Response for unknown or expired request, discarding");
                false
            }
        }
    }

    pub fn complete_pending_exceptionally(&self, correlation_id: &str, error: ReplyError) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, pending)) => {
                let _ = pending.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove a pending entry without completing it (timeout or requester
    /// disconnect). Scoped to the subdomain that created it.
    pub fn unregister_pending(&self, subdomain: &str, correlation_id: &str) {
        self.pending
            .remove_if(correlation_id, |_, pending| pending.subdomain == subdomain);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn cancel_pending_for(&self, subdomain: &str) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().subdomain == subdomain)
            .map(|entry| entry.key().clone())
            .collect();
        if !ids.is_empty() {
            warn!(subdomain, count = ids.len(), "Cancelling in-flight requests for lost tunnel");
        }
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(ReplyError::Cancelled));
            }
        }
    }

    /// Immediate-shutdown path: drop every tunnel at once.
    pub fn clear(&self) {
        let subdomains: Vec<String> = self.tunnels.iter().map(|entry| entry.key().clone()).collect();
        for subdomain in subdomains {
            self.unregister(&subdomain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::FrameType;

    fn tunnel(subdomain: &str) -> (Arc<Tunnel>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Tunnel::new(subdomain, tx)), rx)
    }

    #[test]
    fn register_is_insert_if_absent() {
        let registry = TunnelRegistry::new();
        let (a, _rx_a) = tunnel("abc");
        let (b, _rx_b) = tunnel("abc");
        assert!(registry.register("abc", a.clone()));
        assert!(!registry.register("abc", b));
        assert!(registry.has("abc"));
        assert!(Arc::ptr_eq(&registry.lookup("abc").unwrap(), &a));
        assert_eq!(registry.tunnel_count(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = TunnelRegistry::new();
        let (t, _rx) = tunnel("abc");
        registry.register("abc", t);
        assert!(registry.unregister("abc").is_some());
        assert!(registry.unregister("abc").is_none());
        assert!(!registry.has("abc"));
    }

    #[test]
    fn unregister_exact_spares_a_replacement() {
        let registry = TunnelRegistry::new();
        let (old, _rx_old) = tunnel("abc");
        let (new, _rx_new) = tunnel("abc");
        registry.register("abc", old.clone());
        registry.unregister("abc");
        registry.register("abc", new.clone());

        // The old session's deferred cleanup must not evict the newcomer.
        registry.unregister_exact(&old);
        assert!(Arc::ptr_eq(&registry.lookup("abc").unwrap(), &new));
        assert!(new.is_active());
    }

    #[test]
    fn unregistered_tunnel_is_deactivated() {
        let registry = TunnelRegistry::new();
        let (t, _rx) = tunnel("abc");
        registry.register("abc", t);
        let removed = registry.unregister("abc").unwrap();
        assert!(!removed.is_active());
    }

    #[test]
    fn pending_ids_are_unique_per_registration() {
        let registry = TunnelRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(registry.register_pending("abc", "id-1", tx1));
        assert!(!registry.register_pending("abc", "id-1", tx2));
    }

    #[test]
    fn first_completer_wins_rest_are_noops() {
        let registry = TunnelRegistry::new();
        let (tx, mut rx) = oneshot::channel();
        registry.register_pending("abc", "id-1", tx);

        assert!(registry.complete_pending(
            "id-1",
            ResponsePayload {
                status_code: 200,
                headers: Default::default(),
                body: None,
            }
        ));
        // Same id again: response already delivered, both are noops.
        assert!(!registry.complete_pending(
            "id-1",
            ResponsePayload {
                status_code: 500,
                headers: Default::default(),
                body: None,
            }
        ));
        assert!(!registry.complete_pending_exceptionally("id-1", ReplyError::Cancelled));

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.unwrap().status_code, 200);
    }

    #[test]
    fn late_response_after_timeout_is_discarded() {
        let registry = TunnelRegistry::new();
        let (tx, _rx) = oneshot::channel();
        registry.register_pending("abc", "id-1", tx);
        registry.unregister_pending("abc", "id-1");
        assert!(!registry.complete_pending(
            "id-1",
            ResponsePayload {
                status_code: 200,
                headers: Default::default(),
                body: None,
            }
        ));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn unregister_pending_checks_subdomain_scope() {
        let registry = TunnelRegistry::new();
        let (tx, _rx) = oneshot::channel();
        registry.register_pending("abc", "id-1", tx);
        registry.unregister_pending("other", "id-1");
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn tunnel_loss_cancels_its_pending_requests() {
        let registry = TunnelRegistry::new();
        let (t, _rx) = tunnel("abc");
        registry.register("abc", t);

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let (tx3, mut rx3) = oneshot::channel();
        registry.register_pending("abc", "id-1", tx1);
        registry.register_pending("abc", "id-2", tx2);
        registry.register_pending("xyz", "id-3", tx3);

        registry.unregister("abc");

        assert!(matches!(rx1.try_recv().unwrap(), Err(ReplyError::Cancelled)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(ReplyError::Cancelled)));
        // Another tunnel's request is untouched.
        assert!(rx3.try_recv().is_err());
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn tunnel_loss_closes_proxy_sessions() {
        let registry = TunnelRegistry::new();
        let (t, _rx) = tunnel("abc");
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        t.ws_proxies
            .insert("ws-1".to_string(), ExternalProxySession::new("abc", "ws-1", frame_tx));
        registry.register("abc", t);

        registry.unregister("abc");

        let frame = frame_rx.recv().await.unwrap();
        assert_eq!(frame.frame_type_opt(), Some(FrameType::Close));
        assert_eq!(frame.close_code, Some(i32::from(close_code::GOING_AWAY)));
    }

    #[tokio::test]
    async fn tunnel_send_queues_for_writer() {
        let (t, mut rx) = tunnel("abc");
        t.send(OutboundMessage::Close {
            code: close_code::GOING_AWAY,
            reason: "bye".to_string(),
        })
        .await
        .unwrap();
        match rx.recv().await.unwrap() {
            OutboundMessage::Close { code, reason } => {
                assert_eq!(code, close_code::GOING_AWAY);
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
