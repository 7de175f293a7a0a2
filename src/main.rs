// src/main.rs

use nix::unistd::{Gid, Uid, chown};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod models;
mod server;
mod store;
mod sys;
#[cfg(test)]
mod testing;

use crate::config::PanelConfig;
use crate::server::PanelService;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SJ_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Binds the RPC socket: stale file removed, rw for owner and group only.
fn bind_socket(socket_path: &Path, gid: Option<u32>) -> Result<UnixListener, Box<dyn std::error::Error>> {
    if let Some(socket_dir) = socket_path.parent() {
        fs::create_dir_all(socket_dir)?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    let mut perms = fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o660);
    fs::set_permissions(socket_path, perms)?;

    if let Some(gid) = gid {
        chown(socket_path, None, Some(Gid::from_raw(gid)))?;
    }
    Ok(listener)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment
    // ==============================================================================

    dotenvy::dotenv().ok();
    init_logging();

    let config = PanelConfig::load()?;
    info!(?config, "configuration loaded");

    if !Uid::effective().is_root() {
        warn!("not running as root; vhost, certificate and systemd changes will likely fail");
    }

    fs::create_dir_all(&config.data_dir)?;

    // ==============================================================================
    // 2. Socket
    // ==============================================================================

    let socket_path = config.socket_path.clone();
    let listener = bind_socket(&socket_path, config.socket_gid)?;

    // ==============================================================================
    // 3. Service
    // ==============================================================================

    let service = Arc::new(PanelService::new(config));
    let app = api::router(service);

    info!("sj-panel listening on {}", socket_path.display());

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;

    if let Err(e) = fs::remove_file(&socket_path) {
        warn!("failed to remove socket {}: {}", socket_path.display(), e);
    }
    served?;
    Ok(())
}
