use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use termgate::config::Config;
use termgate::process::ProcessManager;
use termgate::provision;
use termgate::proxy::RouterServer;
use termgate::sessions::SessionMultiplexer;
use termgate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("termgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    if config.routes.is_empty() {
        anyhow::bail!("no routes configured in {}", config_path.display());
    }

    print_startup_banner(&config);

    // Resolve the terminal binary only when some route actually needs it
    let backend_binary = if config.routes.iter().any(|r| r.command.is_none()) {
        let binary = provision::resolve_executable(config.server.backend_binary.as_deref())?;
        info!(path = %binary.display(), "Terminal backend binary resolved");
        Some(binary)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the process registry; ports are allocated here
    let manager = ProcessManager::new(&config, backend_binary, shutdown_rx.clone());

    // Register per-route session limits
    let sessions = Arc::new(SessionMultiplexer::new());
    for route in manager.routes() {
        sessions.register(&route.path, route.max_clients(&config.defaults));
    }

    // Spawn eager backends before accepting traffic
    manager.start_all().await;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("invalid bind address: {}", e)
        })?;

    let router = RouterServer::new(
        bind_addr,
        Arc::clone(&manager),
        Arc::clone(&sessions),
        shutdown_rx.clone(),
    );

    let router_handle = tokio::spawn(async move {
        if let Err(e) = router.run().await {
            error!(error = %e, "Router server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown, then stop every backend within the deadline
    let _ = shutdown_tx.send(true);
    manager.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), router_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        base_port = config.defaults.base_port,
        max_clients = config.defaults.max_clients,
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        max_retries = config.defaults.max_retries,
        "Route defaults"
    );
    info!(
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        shutdown_deadline_secs = config.defaults.shutdown_deadline_secs,
        "Shutdown settings"
    );
    info!(
        route_count = config.routes.len(),
        routes = ?config.routes.iter().map(|r| r.path.as_str()).collect::<Vec<_>>(),
        "Configured routes"
    );
}
