//! Tunnel client engine: connects to the relay server, replays forwarded
//! traffic against the local origin, and reconnects with backoff.

pub mod config;
pub mod dispatch;
pub mod origin_http;
pub mod origin_ws;
pub mod reconnect;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::{ClientConfig, ConfigError, LogLevel};

use crate::dispatch::SessionEnd;
use crate::reconnect::Backoff;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected credentials; not retryable.
    #[error("Authentication failed: Invalid secret key")]
    AuthFailed,

    /// Terminal policy rejection other than credentials, e.g. a taken
    /// subdomain.
    #[error("{0}")]
    Rejected(String),

    /// Could not reach the relay server.
    #[error("{0}")]
    Connect(String),
}

/// Run the tunnel until the shutdown token fires. Reconnects with backoff
/// on connection loss when enabled; authentication failures and a failed
/// first connection are terminal.
pub async fn run(config: ClientConfig, shutdown: CancellationToken) -> Result<(), ClientError> {
    let mut backoff = Backoff::new();
    let mut ever_connected = false;

    loop {
        let session = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            session = dispatch::connect_and_serve(&config, &shutdown) => session,
        };

        match session {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::Closed) => {
                ever_connected = true;
                backoff.reset();
                if !config.reconnect {
                    info!("Connection closed and reconnect is disabled, exiting");
                    return Ok(());
                }
            }
            Err(error @ (ClientError::AuthFailed | ClientError::Rejected(_))) => return Err(error),
            Err(ClientError::Connect(message)) => {
                if !ever_connected || !config.reconnect {
                    return Err(ClientError::Connect(message));
                }
                warn!("{message}");
            }
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:.1}s…", delay.as_secs_f64());
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
