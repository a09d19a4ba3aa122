use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use mariner::auth::UserAccountStore;
use mariner::config::{self, Config};
use mariner::metrics::start_metrics_server;
use mariner::worker::{Service, Workers};

/// Version of the loaded user accounts, bumped on every reload
static USERS_VERSION: AtomicU64 = AtomicU64::new(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let (config, config_path) = load_or_default_config();
    let users = Arc::new(UserAccountStore::from_config(
        &config.users,
        USERS_VERSION.load(Ordering::Relaxed),
    )?);

    if let Some(addr) = config.metrics.listen_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    info!(
        router = ?config.router.kind,
        servers = config.servers.len(),
        users = users.len(),
        "Configuration loaded"
    );

    let service = Arc::new(Service::new(config.clone()));
    let workers = Arc::new(Workers::start(config.server.workers, service, users)?);

    #[cfg(unix)]
    if let Some(path) = config_path {
        tokio::spawn(reload_users_on_sighup(path, workers.clone()));
    }
    #[cfg(not(unix))]
    let _ = config_path;

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, workers = workers.len(), "Mariner listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = workers.dispatch(stream, peer) {
                    warn!(peer = %peer, error = %e, "Failed to hand connection to a worker");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    drop(listener);
    match Arc::try_unwrap(workers) {
        Ok(workers) => tokio::task::spawn_blocking(move || workers.shutdown()).await?,
        Err(_) => warn!("Workers still referenced, exiting without waiting for sessions"),
    }
    Ok(())
}

fn load_or_default_config() -> (Config, Option<PathBuf>) {
    let mut config_paths: Vec<PathBuf> = Vec::new();
    if let Ok(path) = std::env::var("MARINER_CONFIG") {
        config_paths.push(path.into());
    }
    config_paths.push("config/mariner.toml".into());
    config_paths.push("mariner.toml".into());

    for path in config_paths {
        match config::load_config(&path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                return (config, Some(path));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    (Config::default(), None)
}

/// Re-read the user accounts on SIGHUP and hand them to every worker
#[cfg(unix)]
async fn reload_users_on_sighup(path: PathBuf, workers: Arc<Workers>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        let version = USERS_VERSION.fetch_add(1, Ordering::Relaxed) + 1;
        let users = config::load_config(&path)
            .map_err(anyhow::Error::from)
            .and_then(|c| Ok(UserAccountStore::from_config(&c.users, version)?));
        match users {
            Ok(users) => {
                info!(version, users = users.len(), "Reloaded user accounts");
                let users = Arc::new(users);
                workers.broadcast(move |ctx| ctx.set_users(users.clone()));
            }
            Err(e) => warn!(error = %e, "User reload failed, keeping the old accounts"),
        }
    }
}
