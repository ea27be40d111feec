use chrono::{DateTime, Utc};
use meter_core::{DailyBreakdown, DailyUsage, UsageReport, fmt_utc, local_date};
use meter_db::{Db, NewSnapshot, PassWrite};
use tracing::info;

use crate::config::EngineConfig;
use crate::delta::{PassComputation, PrevState, compute_pass};
use crate::error::{EngineError, Result};
use crate::pricer::Pricer;

/// What one completed collection pass did, for logging and the trigger
/// endpoint's response.
#[derive(Debug, Clone)]
pub struct PassStats {
    pub snapshot_id: i64,
    pub model_rows: usize,
    pub date: String,
    pub requests_delta: u64,
    pub tokens_delta: u64,
    pub cost_delta: f64,
    pub skipped_models: Vec<String>,
    pub upstream_restart: bool,
}

/// One full delta-engine pass: snapshot the report, derive increments
/// against the previous snapshot, and fold them into today's aggregate.
/// Everything lands in one store transaction; a failed pass changes
/// nothing and the next pass retries against a larger report.
pub fn run_pass(
    db: &mut Db,
    report: &UsageReport,
    pricer: &dyn Pricer,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<PassStats> {
    let prev = match db.latest_snapshot()? {
        Some(snapshot) => {
            let rows = db.model_rows_for_snapshot(snapshot.id)?;
            Some(PrevState { snapshot, rows })
        }
        None => None,
    };
    let comp = compute_pass(report, prev.as_ref(), pricer, config);

    let date = local_date(now, config.timezone_offset_hours)
        .format("%Y-%m-%d")
        .to_string();
    let existing = db.get_daily(&date)?;
    let daily = merge_daily(existing, &comp, &date)?;

    let snapshot = NewSnapshot {
        captured_at: fmt_utc(now),
        raw_json: serde_json::to_string(report)?,
        total_requests: report.total_requests,
        success_count: report.success_count,
        failure_count: report.failure_count,
        total_tokens: report.total_tokens,
    };
    let snapshot_id = db.commit_pass(&PassWrite {
        snapshot: &snapshot,
        cumulative_cost_usd: comp.cumulative_cost_usd,
        rows: &comp.rows,
        daily: &daily,
    })?;

    info!(
        snapshot_id,
        date = date.as_str(),
        requests = comp.global.requests,
        tokens = comp.global.tokens,
        cost = comp.global.cost,
        skipped = comp.skipped_models.len(),
        "collection pass committed"
    );
    Ok(PassStats {
        snapshot_id,
        model_rows: comp.rows.len(),
        date,
        requests_delta: comp.global.requests,
        tokens_delta: comp.global.tokens,
        cost_delta: comp.global.cost,
        skipped_models: comp.skipped_models.clone(),
        upstream_restart: comp.coarse.restarted,
    })
}

/// Fold a pass's breakdown delta into the daily row. Top-level totals are
/// rewritten from the merged breakdown whenever it carries anything, so
/// the row stays internally consistent by construction; a report with no
/// per-model data falls back to accumulating the coarse delta.
fn merge_daily(
    existing: Option<DailyUsage>,
    comp: &PassComputation,
    date: &str,
) -> Result<DailyUsage> {
    let mut daily = existing.unwrap_or_else(|| DailyUsage {
        date: date.to_string(),
        total_requests: 0,
        success_count: 0,
        failure_count: 0,
        total_tokens: 0,
        total_cost_usd: 0.0,
        breakdown: DailyBreakdown::default(),
    });
    daily.breakdown.merge(&comp.breakdown_delta);
    daily.success_count += comp.global.success;
    daily.failure_count += comp.global.failure;

    let (requests, tokens, cost) = daily.breakdown.totals_from_models();
    if requests > 0 || tokens > 0 || cost > 0.0 {
        daily.total_requests = requests;
        daily.total_tokens = tokens;
        daily.total_cost_usd = cost;
        verify_self_healed(&daily)?;
    } else {
        daily.total_requests += comp.coarse.requests.max(0) as u64;
        daily.total_tokens += comp.coarse.tokens.max(0) as u64;
        daily.total_cost_usd += comp.coarse.cost.max(0.0);
    }
    Ok(daily)
}

fn verify_self_healed(daily: &DailyUsage) -> Result<()> {
    let (requests, tokens, cost) = daily.breakdown.totals_from_models();
    if requests != daily.total_requests
        || tokens != daily.total_tokens
        || (cost - daily.total_cost_usd).abs() > 1e-9
    {
        return Err(EngineError::Invariant(format!(
            "daily {} totals diverge from breakdown: {}/{} requests, {}/{} tokens, {}/{} cost",
            daily.date,
            daily.total_requests,
            requests,
            daily.total_tokens,
            tokens,
            daily.total_cost_usd,
            cost
        )));
    }
    Ok(())
}
