use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use meter_core::{
    ModelUsageRow, RateLimitConfig, RateLimitStatus, fmt_ts, fmt_utc, local_now, parse_ts,
    window_bounds,
};
use meter_db::Db;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOutcome {
    pub reconciled: usize,
    pub failed: usize,
}

/// Recompute every limit's status from the model-usage rows. Configs fail
/// independently: one bad config logs and the pass moves on.
pub fn reconcile_all(db: &Db, config: &EngineConfig, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
    let configs = db.list_limit_configs()?;
    let mut outcome = ReconcileOutcome::default();
    for limit in configs {
        let result = reconcile_one(db, &limit, config, now)
            .and_then(|status| Ok(db.upsert_limit_status(&status)?));
        match result {
            Ok(()) => outcome.reconciled += 1,
            Err(err) => {
                warn!(config_id = limit.id, %err, "failed to reconcile limit");
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

fn reconcile_one(
    db: &Db,
    limit: &RateLimitConfig,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<RateLimitStatus> {
    let now_local = local_now(now, config.timezone_offset_hours);
    let (natural_start, next_reset) =
        window_bounds(limit.reset_strategy, limit.window_minutes, now_local);
    let mut window_start = natural_start.with_timezone(&Utc);
    // A manual reset stamps an anchor on the config; it overrides the
    // natural start until the window rolls past it on its own.
    if let Some(anchor) = &limit.reset_anchor {
        let anchor = parse_ts(anchor)?;
        if anchor > window_start {
            window_start = anchor;
        }
    }
    let window_start_s = fmt_utc(window_start);
    let (used_tokens, used_requests) =
        window_usage(db, &limit.model_pattern, &window_start_s, window_start, config)?;
    Ok(build_status(
        limit,
        used_tokens,
        used_requests,
        window_start_s,
        fmt_ts(next_reset),
        fmt_utc(now),
    ))
}

/// Status row for a just-reset limit: nothing used, full budget, window
/// opening now.
pub fn reset_status(limit: &RateLimitConfig, config: &EngineConfig, now: DateTime<Utc>) -> RateLimitStatus {
    let now_local = local_now(now, config.timezone_offset_hours);
    let (_, next_reset) = window_bounds(limit.reset_strategy, limit.window_minutes, now_local);
    build_status(limit, 0, 0, fmt_utc(now), fmt_ts(next_reset), fmt_utc(now))
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ModelReading {
    tokens: f64,
    requests: f64,
}

fn usage_map(rows: &[ModelUsageRow]) -> BTreeMap<String, ModelReading> {
    let mut map: BTreeMap<String, ModelReading> = BTreeMap::new();
    for row in rows {
        let entry = map.entry(row.model_name.clone()).or_default();
        entry.tokens += row.total_tokens as f64;
        entry.requests += row.request_count as f64;
    }
    map
}

/// Tokens and requests consumed inside the window by models matching the
/// pattern: delta of the latest cumulative reading against a baseline at
/// the window boundary.
fn window_usage(
    db: &Db,
    pattern: &str,
    window_start_s: &str,
    window_start: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<(u64, u64)> {
    let Some(latest) = db.latest_row_time(pattern)? else {
        return Ok((0, 0));
    };
    if latest.as_str() < window_start_s {
        // no activity since the window opened
        return Ok((0, 0));
    }
    let Some(first_inner) = db.first_row_time_at_or_after(pattern, window_start_s)? else {
        return Ok((0, 0));
    };
    let baseline_time = db.last_row_time_before(pattern, window_start_s)?;

    let curr = usage_map(&db.rows_at(pattern, &latest)?);
    let baseline = match baseline_time {
        // Scraping started inside the window: optimistically treat the
        // first inner snapshot as the baseline rather than charging the
        // whole cumulative history to this window.
        None => usage_map(&db.rows_at(pattern, &first_inner)?),
        Some(base_time) => {
            let base_map = usage_map(&db.rows_at(pattern, &base_time)?);
            let base_ts = parse_ts(&base_time)?;
            let first_ts = parse_ts(&first_inner)?;
            if first_ts - base_ts > Duration::minutes(config.gap_threshold_minutes) {
                // A long idle gap straddles the boundary; without the
                // interpolated baseline the whole gap's usage would look
                // like it happened inside the window.
                let first_map = usage_map(&db.rows_at(pattern, &first_inner)?);
                interpolate(&base_map, &first_map, base_ts, first_ts, window_start)
            } else {
                base_map
            }
        }
    };

    let mut used_tokens = 0.0;
    let mut used_requests = 0.0;
    for (model, cur) in &curr {
        let base = baseline.get(model).copied().unwrap_or_default();
        let mut d_tokens = cur.tokens - base.tokens;
        let mut d_requests = cur.requests - base.requests;
        if d_tokens < 0.0 || d_requests < 0.0 {
            d_tokens = cur.tokens;
            d_requests = cur.requests;
        }
        let baseline_empty = base.tokens == 0.0 && base.requests == 0.0;
        if baseline_empty
            && d_tokens > config.false_start_token_threshold as f64
            && (d_tokens - cur.tokens).abs() < config.false_start_token_tolerance as f64
        {
            warn!(
                model = model.as_str(),
                tokens = d_tokens,
                "skipping false-start model in limit window"
            );
            continue;
        }
        used_tokens += d_tokens;
        used_requests += d_requests;
    }
    Ok((
        used_tokens.round().max(0.0) as u64,
        used_requests.round().max(0.0) as u64,
    ))
}

/// Synthetic reading for every model at the window boundary, linearly
/// interpolated between the readings on either side of it.
fn interpolate(
    base: &BTreeMap<String, ModelReading>,
    first: &BTreeMap<String, ModelReading>,
    base_ts: DateTime<Utc>,
    first_ts: DateTime<Utc>,
    at: DateTime<Utc>,
) -> BTreeMap<String, ModelReading> {
    let span = (first_ts - base_ts).num_seconds() as f64;
    if span <= 0.0 {
        return base.clone();
    }
    let ratio = ((at - base_ts).num_seconds() as f64 / span).clamp(0.0, 1.0);
    let mut out = BTreeMap::new();
    for model in base.keys().chain(first.keys()) {
        if out.contains_key(model) {
            continue;
        }
        let b = base.get(model).copied().unwrap_or_default();
        let f = first.get(model).copied().unwrap_or_default();
        out.insert(
            model.clone(),
            ModelReading {
                tokens: b.tokens + ratio * (f.tokens - b.tokens),
                requests: b.requests + ratio * (f.requests - b.requests),
            },
        );
    }
    out
}

fn build_status(
    limit: &RateLimitConfig,
    used_tokens: u64,
    used_requests: u64,
    window_start: String,
    next_reset: String,
    last_updated: String,
) -> RateLimitStatus {
    let token_limit = limit.token_limit.filter(|v| *v > 0);
    let request_limit = limit.request_limit.filter(|v| *v > 0);
    let remaining_tokens = token_limit.map(|l| l.saturating_sub(used_tokens));
    let remaining_requests = request_limit.map(|l| l.saturating_sub(used_requests));
    let (percentage, status_label) = if let Some(l) = token_limit {
        (
            percent_remaining(l.saturating_sub(used_tokens), l),
            format!("{used_tokens}/{l} tokens used"),
        )
    } else if let Some(l) = request_limit {
        (
            percent_remaining(l.saturating_sub(used_requests), l),
            format!("{used_requests}/{l} requests used"),
        )
    } else {
        (100, format!("{used_tokens} tokens used (no limit)"))
    };
    RateLimitStatus {
        config_id: limit.id,
        used_tokens,
        used_requests,
        remaining_tokens,
        remaining_requests,
        percentage,
        status_label,
        window_start,
        next_reset,
        last_updated,
    }
}

fn percent_remaining(remaining: u64, limit: u64) -> u64 {
    (((remaining as f64 / limit as f64) * 100.0).floor() as u64).min(100)
}
