use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::info;

use relay_server::config::ServerSettings;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    relay_server::init_tracing();

    let config_path = std::env::var("RELAY_CONFIG").ok().map(PathBuf::from);
    let mut settings = ServerSettings::load(config_path.as_deref())?;
    settings.apply_env();
    settings.validate()?;

    info!(
        domain = %settings.domain,
        port = settings.port,
        keys = settings.secret_keys.len(),
        "Relay configuration loaded"
    );

    let shutdown = CancellationToken::new();
    relay_server::spawn_signal_handler(shutdown.clone());
    relay_server::serve(settings, shutdown).await
}
