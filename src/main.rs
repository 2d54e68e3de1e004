//! 同步守护进程
//!
//! 打开本地数据库，连接远端存储，为已登录用户注册周期同步并立即对账一次，
//! Ctrl+C 时停止调度。
//!
//! 用法：`study-sync [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use study_sync_lib::config::SyncConfig;
use study_sync_lib::database::Database;
use study_sync_lib::logging;
use study_sync_lib::remote::create_remote_store;
use study_sync_lib::sync::NetworkMonitor;
use study_sync_lib::SyncEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::from_env_and_file(config_path.as_deref())?;
    logging::init_tracing(&config.log_filter)?;
    config.validate()?;

    info!(
        "[Main] Starting study-sync (database: {}, remote: {})",
        config.database_path.display(),
        config.remote.provider
    );

    let database = Arc::new(Database::new(&config.database_path)?);
    let remote = create_remote_store(&config.remote)?;
    let network = NetworkMonitor::new(config.network.start_online);
    let engine = SyncEngine::new(
        database,
        Arc::clone(&remote),
        config.scheduler.clone(),
        network.clone(),
    );

    let probe_cancel = CancellationToken::new();
    let probe = network.spawn_probe(
        remote,
        config.network.probe_interval(),
        probe_cancel.clone(),
    );

    let owner = config.owner_context();
    if owner.is_authenticated() {
        let claimed = engine.claim_anonymous_records(&owner)?;
        if claimed > 0 {
            info!("[Main] Claimed {} anonymous record(s)", claimed);
        }
        engine.start_periodic(&owner);
        engine.request_full_sync(&owner);
    } else {
        warn!("[Main] No owner configured; local records stay unsynced until sign-in");
    }

    for backlog in engine.backlog(&owner)? {
        info!(
            "[Main] {}: {} pending upsert(s), {} pending delete(s), {} blocked",
            backlog.entity, backlog.pending_upserts, backlog.pending_deletes, backlog.blocked
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("[Main] Shutting down");
    engine.shutdown();
    probe_cancel.cancel();
    engine.scheduler().wait_until_idle().await;
    probe.await?;
    Ok(())
}
