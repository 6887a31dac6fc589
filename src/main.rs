//! twofa-relay - pairs mobile authenticators with browser extensions and
//! relays one-time 2FA tokens between them over WebSocket channels.

use anyhow::{Context, Result};
use clap::Parser;
use relay_auth::{JsonStore, Store};
use relay_core::{Config, PairingPolicy};
use relay_server::{create_router, load_tls_config, AppState, LogNotifier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// 2FA token relay server
#[derive(Parser, Debug)]
#[command(name = "twofa-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server port
    #[arg(short, long, env = "RELAY_PORT", default_value = "8080")]
    port: u16,

    /// Only accept WebSocket upgrades carrying this Origin header
    #[arg(long, env = "WEBSOCKET_ALLOWED_ORIGIN")]
    allowed_origin: Option<String>,

    /// Absolute lifetime of a WebSocket connection, in seconds
    #[arg(long, default_value = "180")]
    connection_lifetime_secs: u64,

    /// How long an empty channel survives to absorb reconnects, in milliseconds
    #[arg(long, default_value = "2000")]
    channel_grace_ms: u64,

    /// Outbound queue capacity per connection
    #[arg(long, default_value = "64")]
    outbound_queue: usize,

    /// How long a token request stays answerable, in seconds
    #[arg(long, default_value = "120")]
    token_request_validity_secs: u64,

    /// How long finished token requests are kept, in seconds
    #[arg(long, default_value = "3600")]
    token_request_retention_secs: u64,

    /// Interval of the expiry/reaping sweep, in seconds
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Pairing policy: exclusive or multi-device
    #[arg(long, default_value = "exclusive")]
    pairing_policy: PairingPolicy,

    /// Path of the JSON store (default: <config dir>/twofa-relay/store.json)
    #[arg(long, env = "RELAY_STORE")]
    store: Option<PathBuf>,

    /// Keep all records in memory only
    #[arg(long, conflicts_with = "store")]
    in_memory: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(args: &Args) {
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .compact()
            .with_env_filter(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("twofa-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::new()
        .with_port(args.port)
        .with_allowed_origin(args.allowed_origin.clone())
        .with_connection_lifetime(Duration::from_secs(args.connection_lifetime_secs))
        .with_channel_grace(Duration::from_millis(args.channel_grace_ms))
        .with_outbound_queue(args.outbound_queue)
        .with_token_request_validity(Duration::from_secs(args.token_request_validity_secs))
        .with_token_request_retention(Duration::from_secs(args.token_request_retention_secs))
        .with_sweep_interval(Duration::from_secs(args.sweep_interval_secs))
        .with_pairing_policy(args.pairing_policy);

    let store: Arc<dyn Store> = if args.in_memory {
        info!("Using in-memory store");
        Arc::new(JsonStore::in_memory())
    } else if let Some(path) = &args.store {
        info!("Using store at {:?}", path);
        Arc::new(
            JsonStore::with_path(path.clone())
                .await
                .context("Failed to open store")?,
        )
    } else {
        info!("Using store at {:?}", JsonStore::default_path().ok());
        Arc::new(JsonStore::new().await.context("Failed to open store")?)
    };

    match &config.allowed_origin {
        Some(origin) => info!("WebSocket origin restricted to {}", origin),
        None => info!("WebSocket origin: any"),
    }
    info!(
        "Pairing policy: {:?}, token validity: {:?}, connection lifetime: {:?}",
        config.pairing_policy, config.token_request_validity, config.connection_lifetime
    );

    let state = Arc::new(AppState::new(config.clone(), store, Arc::new(LogNotifier)));
    let router = create_router(state.clone());

    // Background expiry/reaping
    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(
        state
            .requests
            .clone()
            .run_sweeper(config.sweep_interval, shutdown.clone()),
    );

    // Ctrl+C: stop the sweeper and tear down every live connection
    let signal_state = state.clone();
    let signal_token = shutdown.clone();
    let on_shutdown = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        signal_token.cancel();
        signal_state.registry.shutdown();
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));

    match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            let (tls_config, fingerprint) = load_tls_config(cert, key)
                .await
                .context("Failed to create TLS config")?;
            info!("Certificate fingerprint: {}", fingerprint);
            info!("Listening on https://{}", addr);

            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                on_shutdown.await;
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
            });

            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(router.into_make_service())
                .await?;
        }
        _ => {
            info!("Listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(on_shutdown)
                .await?;
        }
    }

    shutdown.cancel();
    sweeper.await.ok();

    info!("Goodbye!");
    Ok(())
}
