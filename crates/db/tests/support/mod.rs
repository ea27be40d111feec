#![allow(dead_code)]

use std::path::PathBuf;

use meter_core::{DailyBreakdown, DailyUsage, ModelSlice, NewModelUsage, RateLimitConfigInput, ResetStrategy};
use meter_db::{Db, NewSnapshot, PassWrite};
use tempfile::TempDir;

pub struct TestDb {
    pub _dir: TempDir,
    pub db: Db,
    pub path: PathBuf,
}

pub fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test.sqlite");
    let mut db = Db::open(&path).expect("open db");
    db.migrate().expect("migrate db");
    TestDb {
        _dir: dir,
        db,
        path,
    }
}

pub fn make_snapshot(
    captured_at: &str,
    requests: u64,
    success: u64,
    failure: u64,
    tokens: u64,
) -> NewSnapshot {
    NewSnapshot {
        captured_at: captured_at.to_string(),
        raw_json: "{}".to_string(),
        total_requests: requests,
        success_count: success,
        failure_count: failure,
        total_tokens: tokens,
    }
}

pub fn make_row(
    endpoint: &str,
    model: &str,
    requests: u64,
    input: u64,
    output: u64,
    cost: f64,
) -> NewModelUsage {
    NewModelUsage {
        api_endpoint: endpoint.to_string(),
        model_name: model.to_string(),
        request_count: requests,
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
        estimated_cost_usd: cost,
    }
}

pub fn make_daily(date: &str, requests: u64, tokens: u64, cost: f64) -> DailyUsage {
    let mut breakdown = DailyBreakdown::default();
    breakdown.models.insert(
        "gpt-4".to_string(),
        ModelSlice {
            requests,
            tokens,
            cost,
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
        },
    );
    DailyUsage {
        date: date.to_string(),
        total_requests: requests,
        success_count: requests,
        failure_count: 0,
        total_tokens: tokens,
        total_cost_usd: cost,
        breakdown,
    }
}

/// Record a snapshot plus model rows the way a collection pass does.
pub fn commit_simple_pass(
    db: &mut Db,
    captured_at: &str,
    requests: u64,
    tokens: u64,
    cumulative_cost: f64,
    rows: &[NewModelUsage],
) -> i64 {
    let snapshot = make_snapshot(captured_at, requests, requests, 0, tokens);
    let daily = make_daily(&captured_at[..10], requests, tokens, cumulative_cost);
    db.commit_pass(&PassWrite {
        snapshot: &snapshot,
        cumulative_cost_usd: cumulative_cost,
        rows,
        daily: &daily,
    })
    .expect("commit pass")
}

pub fn make_config_input(
    pattern: &str,
    window_minutes: i64,
    strategy: ResetStrategy,
    token_limit: Option<u64>,
    request_limit: Option<u64>,
) -> RateLimitConfigInput {
    RateLimitConfigInput {
        model_pattern: pattern.to_string(),
        window_minutes,
        reset_strategy: strategy,
        token_limit,
        request_limit,
    }
}
