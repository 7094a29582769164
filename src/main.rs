use idlegate::config::{CliAction, CliArgs, Config, USAGE};
use idlegate::coordinator::Coordinator;
use idlegate::server::ProxyServer;
use idlegate::{PKG_NAME, VERSION};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idlegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let cli = CliArgs::parse(std::env::args().skip(1))?;
    match cli.action {
        CliAction::Help => {
            println!("{}", USAGE);
            return Ok(());
        }
        CliAction::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        CliAction::Run => {}
    }

    let config = Config::from_cli(&cli).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Coordinator::new(&config);
    let server = ProxyServer::bind(config.server.bind_addr()?, coordinator, shutdown_rx).await?;

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = &mut server_handle => {
                error!("Proxy server exited unexpectedly");
                return Ok(());
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = &mut server_handle => {
                error!("Proxy server exited unexpectedly");
                return Ok(());
            }
        }
    }

    // Signal shutdown; the server stops the backend on its way out
    let _ = shutdown_tx.send(true);

    let wait = Duration::from_secs(5).saturating_add(config.backend.shutdown_grace_period());
    if tokio::time::timeout(wait, server_handle).await.is_err() {
        error!(wait_secs = wait.as_secs(), "Timed out waiting for shutdown");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        host = %config.server.host,
        port = config.server.port,
        backend = %config.backend.target(),
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        working_dir = ?config.backend.working_dir,
        "Backend command"
    );
    info!(
        idle_timeout_secs = config.backend.idle_timeout_secs,
        startup_timeout_secs = config.backend.startup_timeout_secs,
        probe_interval_ms = config.backend.probe_interval_ms,
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        "Lifecycle settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
}
