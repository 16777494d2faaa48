use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trellis_core::{load_config, validate_config, Config, Transport, WebSocketTransport};
use trellis_server::api::create_router;
use trellis_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // The subscriber may not be installed yet when config loading fails.
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Determine config path
    let config_path = std::env::var("TRELLIS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("trellis.toml"));

    // Load configuration
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config);
    info!(version = VERSION, "Loaded configuration from {:?}", config_path);

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Service websocket: {}", config.server.websocket_url);
    info!("Service REST API: {}", config.server.rest_api_url);
    info!("Download directory: {:?}", config.storage.download_dir);

    let transport: Arc<dyn Transport> =
        Arc::new(WebSocketTransport::new(&config.server.websocket_url));
    let state = Arc::new(
        AppState::build(config.clone(), transport)
            .await
            .context("Failed to initialize client components")?,
    );

    // Pick up tasks left in flight by a previous run
    let recovered = state.orchestrator().recover().await;
    if recovered > 0 {
        info!("Reattached {} tasks from a previous run", recovered);
    }

    let maintenance = tokio::spawn(maintenance_loop(Arc::clone(&state), config.clone()));

    // Create router
    let app = create_router(Arc::clone(&state));

    // Start server
    let addr = SocketAddr::new(config.api.host, config.api.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    maintenance.abort();
    state.orchestrator().shutdown().await;

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=debug", config.logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Periodically sweep expired artifacts and close idle sessions.
async fn maintenance_loop(state: Arc<AppState>, config: Config) {
    let period = config.storage.sweep_interval().max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    let idle = config.server.idle_timeout();

    loop {
        interval.tick().await;

        match state.store().sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => {
                info!(removed, "Swept expired artifacts");
                state.ws_broadcaster().cache_swept(removed);
            }
            Err(e) => warn!(error = %e, "Artifact sweep failed"),
        }

        match state.orchestrator().close_idle_sessions(idle).await {
            Ok(closed) => {
                for session_id in closed {
                    state.ws_broadcaster().session_closed(&session_id);
                }
            }
            Err(e) => warn!(error = %e, "Closing idle sessions failed"),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
