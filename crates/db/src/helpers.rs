use meter_core::{DailyBreakdown, DailyUsage, ModelUsageRow, RateLimitConfig, RateLimitStatus, ResetStrategy, Snapshot};
use rusqlite::Row;
use tracing::warn;

pub(crate) fn row_to_snapshot(row: &Row<'_>) -> std::result::Result<Snapshot, rusqlite::Error> {
    Ok(Snapshot {
        id: row.get(0)?,
        captured_at: row.get(1)?,
        total_requests: row.get::<_, i64>(2)? as u64,
        success_count: row.get::<_, i64>(3)? as u64,
        failure_count: row.get::<_, i64>(4)? as u64,
        total_tokens: row.get::<_, i64>(5)? as u64,
        cumulative_cost_usd: row.get(6)?,
    })
}

pub(crate) fn row_to_model_usage(
    row: &Row<'_>,
) -> std::result::Result<ModelUsageRow, rusqlite::Error> {
    Ok(ModelUsageRow {
        id: row.get(0)?,
        snapshot_id: row.get(1)?,
        api_endpoint: row.get(2)?,
        model_name: row.get(3)?,
        request_count: row.get::<_, i64>(4)? as u64,
        input_tokens: row.get::<_, i64>(5)? as u64,
        output_tokens: row.get::<_, i64>(6)? as u64,
        total_tokens: row.get::<_, i64>(7)? as u64,
        estimated_cost_usd: row.get(8)?,
        captured_at: row.get(9)?,
    })
}

pub(crate) fn row_to_daily(row: &Row<'_>) -> std::result::Result<DailyUsage, rusqlite::Error> {
    let date: String = row.get(0)?;
    let breakdown_json: String = row.get(6)?;
    Ok(DailyUsage {
        breakdown: parse_breakdown(&date, &breakdown_json),
        date,
        total_requests: row.get::<_, i64>(1)? as u64,
        success_count: row.get::<_, i64>(2)? as u64,
        failure_count: row.get::<_, i64>(3)? as u64,
        total_tokens: row.get::<_, i64>(4)? as u64,
        total_cost_usd: row.get(5)?,
    })
}

/// An unreadable breakdown document degrades to empty rather than wedging
/// every later pass; the next merge rebuilds it from fresh deltas.
fn parse_breakdown(date: &str, value: &str) -> DailyBreakdown {
    match serde_json::from_str(value) {
        Ok(breakdown) => breakdown,
        Err(err) => {
            warn!(date, %err, "dropping unreadable breakdown document");
            DailyBreakdown::default()
        }
    }
}

pub(crate) fn row_to_limit_config(
    row: &Row<'_>,
) -> std::result::Result<RateLimitConfig, rusqlite::Error> {
    let strategy: String = row.get(3)?;
    Ok(RateLimitConfig {
        id: row.get(0)?,
        model_pattern: row.get(1)?,
        window_minutes: row.get(2)?,
        reset_strategy: ResetStrategy::parse(&strategy).unwrap_or(ResetStrategy::Rolling),
        token_limit: row.get::<_, Option<i64>>(4)?.map(|v| v.max(0) as u64),
        request_limit: row.get::<_, Option<i64>>(5)?.map(|v| v.max(0) as u64),
        reset_anchor: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub(crate) fn row_to_limit_status(
    row: &Row<'_>,
) -> std::result::Result<RateLimitStatus, rusqlite::Error> {
    Ok(RateLimitStatus {
        config_id: row.get(0)?,
        used_tokens: row.get::<_, i64>(1)? as u64,
        used_requests: row.get::<_, i64>(2)? as u64,
        remaining_tokens: row.get::<_, Option<i64>>(3)?.map(|v| v.max(0) as u64),
        remaining_requests: row.get::<_, Option<i64>>(4)?.map(|v| v.max(0) as u64),
        percentage: row.get::<_, i64>(5)?.clamp(0, 100) as u64,
        status_label: row.get(6)?,
        window_start: row.get(7)?,
        next_reset: row.get(8)?,
        last_updated: row.get(9)?,
    })
}

/// Delta between consecutive cumulative readings of one (endpoint, model)
/// key. A counter that went backwards means the upstream restarted, so the
/// current reading is itself the increment.
pub(crate) fn delta_counts(
    prev: Option<&(u64, u64, f64)>,
    current: (u64, u64, f64),
) -> (u64, u64, f64) {
    match prev {
        Some(&(prev_requests, prev_tokens, prev_cost)) => {
            if current.0 >= prev_requests && current.1 >= prev_tokens {
                (
                    current.0 - prev_requests,
                    current.1 - prev_tokens,
                    (current.2 - prev_cost).max(0.0),
                )
            } else {
                current
            }
        }
        None => current,
    }
}
