use std::collections::BTreeMap;

use meter_core::{
    DailyBreakdown, ModelSlice, ModelUsageRow, NewModelUsage, Snapshot, UsageReport, UsageSlice,
};
use tracing::warn;

use crate::config::EngineConfig;
use crate::pricer::Pricer;

/// The snapshot written by the previous pass, with its per-model rows.
#[derive(Debug, Clone)]
pub struct PrevState {
    pub snapshot: Snapshot,
    pub rows: Vec<ModelUsageRow>,
}

/// Difference of the global scalar counters between two snapshots, after
/// restart handling and false-start subtraction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoarseDelta {
    pub requests: i64,
    pub success: i64,
    pub failure: i64,
    pub tokens: i64,
    pub cost: f64,
    pub restarted: bool,
}

/// Final per-pass increment; requests/tokens/cost come from the granular
/// side, which is authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GlobalDelta {
    pub requests: u64,
    pub success: u64,
    pub failure: u64,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Default)]
pub struct PassComputation {
    pub rows: Vec<NewModelUsage>,
    /// Cost tabulated from this report alone.
    pub snapshot_cost: f64,
    pub cumulative_cost_usd: f64,
    pub breakdown_delta: DailyBreakdown,
    pub coarse: CoarseDelta,
    pub global: GlobalDelta,
    pub skipped_models: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyCounters {
    requests: u64,
    tokens: u64,
    cost: f64,
    input: u64,
    output: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyDelta {
    requests: i64,
    tokens: i64,
    cost: f64,
    input: i64,
    output: i64,
}

impl KeyDelta {
    fn from_current(cur: KeyCounters) -> Self {
        KeyDelta {
            requests: cur.requests as i64,
            tokens: cur.tokens as i64,
            cost: cur.cost,
            input: cur.input as i64,
            output: cur.output as i64,
        }
    }
}

/// Turn one cumulative report into the increments a pass persists.
///
/// Pure: no clock, no store. `prev` is whatever snapshot the store holds
/// from the previous pass, or `None` on the very first one.
pub fn compute_pass(
    report: &UsageReport,
    prev: Option<&PrevState>,
    pricer: &dyn Pricer,
    config: &EngineConfig,
) -> PassComputation {
    // Cost tabulation: one row per (endpoint, model), priced from the
    // summed detail tokens.
    let mut rows = Vec::new();
    let mut snapshot_cost = 0.0;
    for (endpoint, endpoint_report) in &report.apis {
        for (model, model_report) in &endpoint_report.models {
            let (input, output) = model_report.token_split();
            let cost = pricer.cost(model, input, output);
            snapshot_cost += cost;
            rows.push(NewModelUsage {
                api_endpoint: endpoint.clone(),
                model_name: model.clone(),
                request_count: model_report.total_requests,
                input_tokens: input,
                output_tokens: output,
                total_tokens: model_report.total_tokens,
                estimated_cost_usd: cost,
            });
        }
    }
    let prev_cumulative = prev.map(|p| p.snapshot.cumulative_cost_usd).unwrap_or(0.0);
    let cumulative_cost_usd = prev_cumulative + snapshot_cost;

    // Coarse delta over the global counters. A negative request or token
    // delta means the upstream restarted and the whole current value is
    // the new increment.
    let mut coarse = match prev {
        Some(p) => {
            let requests = report.total_requests as i64 - p.snapshot.total_requests as i64;
            let tokens = report.total_tokens as i64 - p.snapshot.total_tokens as i64;
            if requests < 0 || tokens < 0 {
                warn!(
                    prev_requests = p.snapshot.total_requests,
                    requests = report.total_requests,
                    "upstream counters went backwards, treating report as a fresh lifetime"
                );
                CoarseDelta {
                    requests: report.total_requests as i64,
                    success: report.success_count as i64,
                    failure: report.failure_count as i64,
                    tokens: report.total_tokens as i64,
                    cost: snapshot_cost,
                    restarted: true,
                }
            } else {
                CoarseDelta {
                    requests,
                    success: report.success_count as i64 - p.snapshot.success_count as i64,
                    failure: report.failure_count as i64 - p.snapshot.failure_count as i64,
                    tokens,
                    cost: snapshot_cost,
                    restarted: false,
                }
            }
        }
        None => CoarseDelta {
            requests: report.total_requests as i64,
            success: report.success_count as i64,
            failure: report.failure_count as i64,
            tokens: report.total_tokens as i64,
            cost: snapshot_cost,
            restarted: false,
        },
    };
    // The success/failure attenuation below compares against the raw
    // global movement, before skipped keys are subtracted back out.
    let raw_requests = coarse.requests;

    // Granular deltas per (endpoint, model).
    let prev_by = keyed(prev.map(|p| p.rows.as_slice()).unwrap_or(&[]));
    let curr_by: BTreeMap<(String, String), KeyCounters> = rows
        .iter()
        .map(|row| {
            (
                (row.api_endpoint.clone(), row.model_name.clone()),
                KeyCounters {
                    requests: row.request_count,
                    tokens: row.total_tokens,
                    cost: row.estimated_cost_usd,
                    input: row.input_tokens,
                    output: row.output_tokens,
                },
            )
        })
        .collect();

    let mut keys: Vec<&(String, String)> = curr_by.keys().chain(prev_by.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut breakdown_delta = DailyBreakdown::default();
    let mut skipped_models = Vec::new();
    for key in keys {
        let cur = curr_by.get(key).copied().unwrap_or_default();
        let prv = prev_by.get(key).copied().unwrap_or_default();
        let mut delta = KeyDelta {
            requests: cur.requests as i64 - prv.requests as i64,
            tokens: cur.tokens as i64 - prv.tokens as i64,
            cost: cur.cost - prv.cost,
            input: cur.input as i64 - prv.input as i64,
            output: cur.output as i64 - prv.output as i64,
        };
        if delta.requests < 0 || delta.tokens < 0 {
            delta = KeyDelta::from_current(cur);
        }
        // False start: the key's entire cumulative cost shows up as one
        // delta, meaning its history predates our scraping. Recording it
        // would charge a day for weeks of use.
        if delta.cost > config.false_start_cost_threshold
            && (delta.cost - cur.cost).abs() < config.false_start_cost_tolerance
        {
            coarse.requests = (coarse.requests - delta.requests).max(0);
            coarse.tokens = (coarse.tokens - delta.tokens).max(0);
            coarse.cost = (coarse.cost - delta.cost).max(0.0);
            warn!(
                endpoint = key.0.as_str(),
                model = key.1.as_str(),
                cost = delta.cost,
                "skipping false-start model, history predates collection"
            );
            skipped_models.push(format!("{}/{}", key.0, key.1));
            continue;
        }
        if delta.requests > 0 || delta.cost > 0.0 {
            fold_key(&mut breakdown_delta, &key.0, &key.1, delta);
        }
    }

    // Granular is authoritative for requests/tokens/cost; success and
    // failure are global-only counters, attenuated proportionally when
    // keys were dropped.
    let (safe_requests, safe_tokens, safe_cost) = breakdown_delta.totals_from_models();
    let mut success = coarse.success.max(0) as u64;
    let mut failure = coarse.failure.max(0) as u64;
    if raw_requests > 0 {
        let ratio = safe_requests as f64 / raw_requests as f64;
        if ratio < 0.99 {
            success = (success as f64 * ratio).round() as u64;
            failure = (failure as f64 * ratio).round() as u64;
        }
    }
    let global = GlobalDelta {
        requests: safe_requests,
        success,
        failure,
        tokens: safe_tokens,
        cost: safe_cost,
    };

    PassComputation {
        rows,
        snapshot_cost,
        cumulative_cost_usd,
        breakdown_delta,
        coarse,
        global,
        skipped_models,
    }
}

fn keyed(rows: &[ModelUsageRow]) -> BTreeMap<(String, String), KeyCounters> {
    rows.iter()
        .map(|row| {
            (
                (row.api_endpoint.clone(), row.model_name.clone()),
                KeyCounters {
                    requests: row.request_count,
                    tokens: row.total_tokens,
                    cost: row.estimated_cost_usd,
                    input: row.input_tokens,
                    output: row.output_tokens,
                },
            )
        })
        .collect()
}

fn fold_key(breakdown: &mut DailyBreakdown, endpoint: &str, model: &str, delta: KeyDelta) {
    let requests = delta.requests.max(0) as u64;
    let tokens = delta.tokens.max(0) as u64;
    let cost = delta.cost.max(0.0);

    let slice = breakdown.models.entry(model.to_string()).or_default();
    *slice = ModelSlice {
        requests: slice.requests + requests,
        tokens: slice.tokens + tokens,
        cost: slice.cost + cost,
        input_tokens: slice.input_tokens + delta.input.max(0) as u64,
        output_tokens: slice.output_tokens + delta.output.max(0) as u64,
    };

    let endpoint_slice = breakdown.endpoints.entry(endpoint.to_string()).or_default();
    endpoint_slice.requests += requests;
    endpoint_slice.tokens += tokens;
    endpoint_slice.cost += cost;
    let nested = endpoint_slice.models.entry(model.to_string()).or_default();
    *nested = UsageSlice {
        requests: nested.requests + requests,
        tokens: nested.tokens + tokens,
        cost: nested.cost + cost,
    };
}
