#![allow(dead_code)]

use chrono::{DateTime, Utc};
use meter_core::{
    EndpointReport, ModelReport, PriceTable, RequestDetail, TokenPair, UsageReport, parse_ts,
};
use meter_db::Db;
use meter_engine::{EngineConfig, PassStats, run_pass};
use tempfile::TempDir;

pub struct TestDb {
    pub _dir: TempDir,
    pub db: Db,
}

pub fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut db = Db::open(dir.path().join("test.sqlite")).expect("open db");
    db.migrate().expect("migrate db");
    TestDb { _dir: dir, db }
}

pub fn ts(value: &str) -> DateTime<Utc> {
    parse_ts(value).expect("timestamp")
}

/// Report builder: models are (endpoint, model, requests, input, output,
/// total_tokens) tuples.
pub fn report(
    totals: (u64, u64, u64, u64),
    models: &[(&str, &str, u64, u64, u64, u64)],
) -> UsageReport {
    let mut report = UsageReport {
        total_requests: totals.0,
        success_count: totals.1,
        failure_count: totals.2,
        total_tokens: totals.3,
        ..UsageReport::default()
    };
    for &(endpoint, model, requests, input, output, tokens) in models {
        report
            .apis
            .entry(endpoint.to_string())
            .or_insert_with(EndpointReport::default)
            .models
            .insert(
                model.to_string(),
                ModelReport {
                    total_requests: requests,
                    total_tokens: tokens,
                    details: vec![RequestDetail {
                        tokens: TokenPair { input, output },
                    }],
                },
            );
    }
    report
}

pub fn pass_at(db: &mut Db, config: &EngineConfig, now: &str, report: &UsageReport) -> PassStats {
    let table = PriceTable::builtin();
    run_pass(db, report, &table, config, ts(now)).expect("run pass")
}

pub fn zero_offset_config() -> EngineConfig {
    EngineConfig {
        timezone_offset_hours: 0,
        ..EngineConfig::default()
    }
}
