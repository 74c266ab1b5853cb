use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use super::parse_api_server_flags;
use crate::core::config::SwarmConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::store::Store;
use crate::core::swarm::SwarmManager;
use crate::core::terminal::{self, print_link, print_status, print_warn};
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging::BroadcastMakeWriter;
use crate::platform::{NativePlatform, Platform};

fn init_logging(log_tx: tokio::sync::broadcast::Sender<String>) {
    let make_writer = BroadcastMakeWriter {
        sender: log_tx,
        suppress_stdout: false,
    };
    let filter = EnvFilter::try_from_env("SWARMD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Runs the daemon in the foreground until Ctrl+C: API server plus the
/// swarm manager, both under the lifecycle manager.
pub async fn serve(args: &[String]) -> Result<()> {
    let data_dir = NativePlatform::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    NativePlatform::restrict_dir_permissions(&data_dir);

    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(500);
    init_logging(log_tx.clone());

    let config = SwarmConfig::load(&data_dir).await?;
    let (api_host, api_port) = parse_api_server_flags(
        args,
        2,
        config.server.api_host.clone(),
        config.server.api_port,
    );

    let store = Store::open(data_dir.join("swarmd.db")).await?;
    let swarm = SwarmManager::new(store, config);

    let run_dir = data_dir.join("run");
    std::fs::create_dir_all(&run_dir)?;
    let pid_file = run_dir.join("swarmd.pid");
    if pid_file.exists() {
        print_warn("A pid file from an earlier daemon exists; overwriting it.");
    }
    std::fs::write(&pid_file, std::process::id().to_string())?;
    NativePlatform::restrict_file_permissions(&pid_file);

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(swarm.clone())));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        swarm,
        log_tx,
        api_host: api_host.clone(),
        api_port,
    }))));

    if let Err(e) = lifecycle.start().await {
        let _ = std::fs::remove_file(&pid_file);
        return Err(e);
    }

    terminal::print_banner();
    print_link("API", &format!("http://{}:{}/api", api_host, api_port));
    print_status("Data", &data_dir.display().to_string());
    print_status("Stop", "Ctrl+C");
    println!();
    info!("swarmd is ready. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down swarmd...");
    lifecycle.shutdown().await?;

    if let Err(e) = std::fs::remove_file(&pid_file) {
        warn!("Could not remove pid file {}: {}", pid_file.display(), e);
    }
    Ok(())
}
