mod config;
mod coordinator;
mod error;
mod http;
mod pricing;
mod upstream;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use meter_db::Db;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::coordinator::{Coordinator, run_scheduler};
use crate::http::{AppState, build_app};
use crate::pricing::PricingOracle;
use crate::upstream::UpstreamClient;

/// How long open HTTP connections get to finish after a stop signal
/// before they are abandoned.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let db = match setup_db(&config.db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(path = %config.db_path.display(), %err, "failed to open store");
            std::process::exit(1);
        }
    };

    let upstream = UpstreamClient::new(&config.cliproxy_url, config.management_key.clone());
    let oracle = PricingOracle::new(config.pricing_url.clone(), config.pricing_ttl);
    let coordinator = Arc::new(Coordinator::new(db, upstream, oracle, config.engine()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let scheduler = tokio::spawn(run_scheduler(
        coordinator.clone(),
        config.interval,
        shutdown_rx.clone(),
    ));

    // Flip the stop switch the moment a termination signal lands, so the
    // scheduler aborts its next tick while the HTTP surface is still
    // draining.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("termination signal received");
        let _ = signal_tx.send(true);
    });

    let state = AppState {
        db_path: config.db_path.clone(),
        coordinator,
    };
    let app = build_app(state);
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.trigger_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(port = config.trigger_port, %err, "failed to bind control surface");
            std::process::exit(1);
        }
    };
    info!(
        port = config.trigger_port,
        upstream = config.cliproxy_url.as_str(),
        "collector listening"
    );

    let serve = axum::serve(listener, app).with_graceful_shutdown(stop_flag(shutdown_rx.clone()));
    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                error!(%err, "control surface error");
            }
        }
        _ = drain_deadline(shutdown_rx) => {
            warn!(
                drain_secs = DRAIN_WINDOW.as_secs(),
                "drain window elapsed, abandoning open connections"
            );
        }
    }

    // covers the server failing on its own, without a signal
    let _ = shutdown_tx.send(true);
    let _ = scheduler.await;
    info!("shutdown complete");
}

fn setup_db(path: &Path) -> meter_db::Result<Db> {
    let mut db = Db::open(path)?;
    db.migrate()?;
    Ok(db)
}

async fn stop_flag(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.changed().await;
}

/// Resolves one drain window after the stop switch flips; racing the
/// server against this bounds how long handlers may linger.
async fn drain_deadline(shutdown: watch::Receiver<bool>) {
    stop_flag(shutdown).await;
    tokio::time::sleep(DRAIN_WINDOW).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
