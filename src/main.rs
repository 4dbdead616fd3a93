use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use relay_client::config::{LogLevel, Overrides};
use relay_client::ClientError;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_CONNECT: u8 = 2;
const EXIT_AUTH: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "relay", version, about = "Expose a local port through a public relay server")]
struct Cli {
    /// Local port to expose (1-65535)
    port: Option<String>,

    /// Relay server hostname
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Shared secret key
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Request a specific subdomain
    #[arg(short = 'd', long)]
    subdomain: Option<String>,

    /// Use ws:// instead of wss://
    #[arg(long)]
    insecure: bool,

    /// Errors only
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Debug output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_tracing(level: LogLevel) {
    let default_filter = match level {
        LogLevel::Quiet => "error",
        LogLevel::Normal => "relay=info,relay_client=info",
        LogLevel::Verbose => "relay=debug,relay_client=debug,relay_proto=debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = color_eyre::install();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_CONFIG,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let cli_overrides = Overrides {
        port: cli.port,
        server: cli.server,
        key: cli.key,
        subdomain: cli.subdomain,
        insecure: cli.insecure.then_some(true),
        reconnect: None,
        log_level: LogLevel::from_flags(cli.quiet, cli.verbose),
    };

    let config = match cli_overrides
        .or(Overrides::from_env())
        .or(Overrides::from_files())
        .resolve()
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_tracing(config.log_level);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                shutdown.cancel();
            }
        }
    });

    match relay_client::run(config, shutdown.clone()).await {
        Ok(()) => {
            if shutdown.is_cancelled() {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(error @ (ClientError::AuthFailed | ClientError::Rejected(_))) => {
            eprintln!("{error}");
            ExitCode::from(EXIT_AUTH)
        }
        Err(error @ ClientError::Connect(_)) => {
            eprintln!("{error}");
            ExitCode::from(EXIT_CONNECT)
        }
    }
}
