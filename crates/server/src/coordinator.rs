use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use meter_db::Db;
use meter_engine::{EngineConfig, reconcile_all, run_pass};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::PassError;
use crate::pricing::PricingOracle;
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Another pass was already in flight; this one coalesced into it.
    Skipped,
}

/// Owns the single writer. The scheduler and the HTTP trigger both funnel
/// through `run_once`, and a one-slot gate guarantees no pass overlaps
/// another.
pub struct Coordinator {
    db: Mutex<Db>,
    upstream: UpstreamClient,
    oracle: PricingOracle,
    engine: EngineConfig,
    in_flight: AtomicBool,
}

impl Coordinator {
    pub fn new(db: Db, upstream: UpstreamClient, oracle: PricingOracle, engine: EngineConfig) -> Self {
        Self {
            db: Mutex::new(db),
            upstream,
            oracle,
            engine,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Small single-row writes (the reset endpoint) share the writer's
    /// mutex instead of opening their own connection.
    pub fn with_db<T>(&self, f: impl FnOnce(&mut Db) -> T) -> T {
        let mut db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut db)
    }

    /// One full pass: fetch, delta engine, reconciler. Errors on either
    /// side are logged once and do not stop the other side.
    pub async fn run_once(&self) -> RunOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RunOutcome::Skipped;
        }
        self.collect().await;
        self.reconcile();
        self.in_flight.store(false, Ordering::Release);
        RunOutcome::Completed
    }

    /// Fire-and-forget entry point for the HTTP trigger.
    pub fn trigger(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if this.run_once().await == RunOutcome::Skipped {
                info!("manual trigger coalesced into the in-flight pass");
            }
        });
    }

    async fn collect(&self) {
        let report = match self.upstream.fetch_usage().await {
            Ok(report) => report,
            Err(err @ PassError::TransientUpstream(_)) => {
                warn!(%err, "skipping collection, next tick retries");
                return;
            }
            Err(err) => {
                error!(%err, "skipping collection, next tick retries");
                return;
            }
        };
        let table = self.oracle.table().await;
        let mut db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = run_pass(&mut db, &report, &table, &self.engine, Utc::now()) {
            error!(%err, "collection pass aborted");
        }
    }

    fn reconcile(&self) {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        match reconcile_all(&db, &self.engine, Utc::now()) {
            Ok(outcome) if outcome.failed > 0 => {
                warn!(
                    reconciled = outcome.reconciled,
                    failed = outcome.failed,
                    "limit reconciliation finished with failures"
                );
            }
            Ok(outcome) => {
                info!(reconciled = outcome.reconciled, "limit reconciliation finished");
            }
            Err(err) => error!(%err, "limit reconciliation aborted"),
        }
    }
}

/// Drive loop: one pass immediately, then one per interval, measured from
/// the end of the previous pass. Shutdown aborts the next tick, never a
/// pass already underway.
pub async fn run_scheduler(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "scheduler started");
    loop {
        coordinator.run_once().await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("scheduler stopped");
                return;
            }
        }
    }
}
