pub mod config;
pub mod registry;
pub mod routes;
pub mod shutdown;
pub mod state;
pub mod subdomain;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerSettings;
use crate::state::AppState;

/// WebSocket close codes used on the tunnel and external endpoints.
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// Initialize tracing/logging for the server.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=info,tower_http=info".into()),
        )
        .init();
}

/// Build the axum router. `/ws` and `/pub` are reserved for the tunnel and
/// external-WebSocket endpoints; every other path falls through to the
/// host-routed proxy handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(routes::tunnel::tunnel_ws))
        .route("/pub", get(routes::public_ws::public_ws))
        .fallback(routes::proxy::proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn a task that listens for Ctrl+C and SIGTERM, then cancels the token.
/// A second signal during the graceful drain forces an immediate exit.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal, draining…");
        shutdown.cancel();
        wait_for_signal().await;
        warn!("Second signal received, exiting immediately");
        std::process::exit(1);
    });
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Run the relay server until the shutdown token fires, then drain
/// gracefully for up to 30 seconds.
pub async fn serve(settings: ServerSettings, shutdown: CancellationToken) -> color_eyre::Result<()> {
    let state = Arc::new(AppState::new(settings));
    let router = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", state.settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, domain = %state.settings.domain, "Relay server listening");

    let drain = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            crate::shutdown::graceful(state, Duration::from_secs(30)).await;
        }
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    if shutdown.is_cancelled() {
        let _ = drain.await;
    } else {
        drain.abort();
    }
    info!("Server stopped");
    Ok(())
}
