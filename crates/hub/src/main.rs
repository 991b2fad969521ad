mod config;
mod db;
mod device;
mod supervisor;
#[cfg(test)]
mod testing;
mod web;
mod worker;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use device::HttpDeviceClient;
use supervisor::Supervisor;
use worker::Services;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:relay.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (controller settings + device seeds) ────────────
    let cfg = config::load(&config_path)?;
    let client = Arc::new(HttpDeviceClient::new(cfg.controller.request_timeout())?);
    config::apply(&cfg, &db, client.as_ref()).await?;

    let devices = db.load_devices().await?;
    if devices.is_empty() {
        warn!("no devices in the directory yet; waiting for provisioning");
    }
    info!(devices = devices.len(), db = %db_url, "directory ready");

    // ── Supervisor ──────────────────────────────────────────────────
    let shared_db = Arc::new(db.clone());
    let services = Services {
        client,
        directory: shared_db.clone(),
        store: shared_db,
    };
    let supervisor = Arc::new(Supervisor::new(
        services,
        cfg.controller.reconcile_interval(),
    ));

    let runner = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run().await })
    };

    // ── Operator API ────────────────────────────────────────────────
    let web_state = web::AppState {
        supervisor: Arc::clone(&supervisor),
        db,
    };
    let web = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("operator api failed: {e:#}");
        }
    });

    shutdown_signal().await;
    info!("termination signal received, stopping controller");

    supervisor.shutdown().await;
    if let Err(e) = runner.await {
        error!("supervisor task failed: {e}");
    }
    if let Err(e) = web.await {
        error!("operator api task failed: {e}");
    }

    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
