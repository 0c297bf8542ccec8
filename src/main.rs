use frpc_fleet::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use frpc_fleet::config::Config;
use frpc_fleet::process::ProcessManager;
use frpc_fleet::provision::Provisioner;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frpc_fleet=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration: file given as first argument, or defaults plus environment
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            let config = Config::from_env()?;
            info!("No configuration file given, using defaults and environment");
            config
        }
    };

    print_startup_banner(&config);

    let layout = config.layout();
    layout.prepare().map_err(|e| {
        error!(path = %layout.root().display(), error = %e, "Failed to create data directories");
        e
    })?;

    let process_manager = ProcessManager::new(layout.clone());
    let provisioner = Arc::new(Provisioner::new(layout, &config.release)?);

    if provisioner.is_installed() {
        match provisioner.current_version().await {
            Ok(version) => info!(%version, path = %provisioner.binary_path().display(), "frpc found"),
            Err(e) => warn!(error = %e, "frpc is present but did not report a version"),
        }
    } else {
        warn!(
            path = %provisioner.binary_path().display(),
            "frpc is not installed; use POST /api/frpc/install or /api/frpc/upload"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid control API address: {}", e))?;
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        AdminState {
            process_manager: Arc::clone(&process_manager),
            provisioner,
            auth_token: admin_token,
            max_upload_bytes: config.server.max_upload_bytes,
            default_log_lines: config.server.default_log_lines,
        },
        shutdown_rx,
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all frpc processes...");
    process_manager.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or, on unix, SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        data_dir = %config.data_dir.display(),
        bind = %config.server.bind,
        port = config.server.port,
        release_endpoint = %config.release.endpoint,
        max_upload_bytes = config.server.max_upload_bytes,
        "Starting frpc fleet manager"
    );
}
