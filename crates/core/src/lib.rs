use std::collections::BTreeMap;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, Offset, SecondsFormat, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

/// Canonical timestamp encoding for everything the store persists.
pub fn fmt_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn fmt_ts(t: DateTime<FixedOffset>) -> String {
    fmt_utc(t.with_timezone(&Utc))
}

pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc))
}

pub fn tz_offset(offset_hours: i32) -> FixedOffset {
    FixedOffset::east_opt(offset_hours.clamp(-23, 23) * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn local_now(now: DateTime<Utc>, offset_hours: i32) -> DateTime<FixedOffset> {
    now.with_timezone(&tz_offset(offset_hours))
}

/// Calendar date the aggregate row for `now` belongs to.
pub fn local_date(now: DateTime<Utc>, offset_hours: i32) -> NaiveDate {
    local_now(now, offset_hours).date_naive()
}

fn day_start(t: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    t.with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetStrategy {
    Daily,
    Weekly,
    Rolling,
}

impl ResetStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetStrategy::Daily => "daily",
            ResetStrategy::Weekly => "weekly",
            ResetStrategy::Rolling => "rolling",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(ResetStrategy::Daily),
            "weekly" => Some(ResetStrategy::Weekly),
            "rolling" => Some(ResetStrategy::Rolling),
            _ => None,
        }
    }
}

/// Natural window boundaries for a limit, in local time.
///
/// Weekly windows open on ISO Monday. A rolling window has no real reset
/// point; `next_reset` carries `now + 1 minute` as a recency hint.
pub fn window_bounds(
    strategy: ResetStrategy,
    window_minutes: i64,
    now_local: DateTime<FixedOffset>,
) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    match strategy {
        ResetStrategy::Daily => {
            let start = day_start(now_local);
            (start, start + Duration::hours(24))
        }
        ResetStrategy::Weekly => {
            let back = now_local.weekday().num_days_from_monday() as i64;
            let start = day_start(now_local) - Duration::days(back);
            (start, start + Duration::days(7))
        }
        ResetStrategy::Rolling => (
            now_local - Duration::minutes(window_minutes.max(0)),
            now_local + Duration::minutes(1),
        ),
    }
}

/// Case-insensitive substring match used by limit configs.
pub fn model_matches_pattern(model: &str, pattern: &str) -> bool {
    model
        .to_ascii_lowercase()
        .contains(&pattern.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Upstream report shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub apis: BTreeMap<String, EndpointReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointReport {
    #[serde(default)]
    pub models: BTreeMap<String, ModelReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub details: Vec<RequestDetail>,
}

impl ModelReport {
    /// Input/output token split summed over the per-request details.
    pub fn token_split(&self) -> (u64, u64) {
        self.details.iter().fold((0u64, 0u64), |(i, o), d| {
            (
                i.saturating_add(d.tokens.input),
                o.saturating_add(d.tokens.output),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDetail {
    #[serde(default)]
    pub tokens: TokenPair,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub captured_at: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_tokens: u64,
    pub cumulative_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsageRow {
    pub id: i64,
    pub snapshot_id: i64,
    pub api_endpoint: String,
    pub model_name: String,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub captured_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewModelUsage {
    pub api_endpoint: String,
    pub model_name: String,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

// ---------------------------------------------------------------------------
// Daily aggregate + breakdown document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSlice {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSlice {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSlice {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
    #[serde(default)]
    pub models: BTreeMap<String, UsageSlice>,
}

/// Two-level breakdown document stored on each daily row.
///
/// The top-level scalars of the daily row are always recomputable from the
/// model map; `totals_from_models` is the one place that does it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyBreakdown {
    #[serde(default)]
    pub models: BTreeMap<String, ModelSlice>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointSlice>,
}

impl DailyBreakdown {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.endpoints.is_empty()
    }

    /// Sum another breakdown into this one, leaf by leaf.
    pub fn merge(&mut self, delta: &DailyBreakdown) {
        for (model, slice) in &delta.models {
            let entry = self.models.entry(model.clone()).or_default();
            entry.requests = entry.requests.saturating_add(slice.requests);
            entry.tokens = entry.tokens.saturating_add(slice.tokens);
            entry.cost += slice.cost;
            entry.input_tokens = entry.input_tokens.saturating_add(slice.input_tokens);
            entry.output_tokens = entry.output_tokens.saturating_add(slice.output_tokens);
        }
        for (endpoint, slice) in &delta.endpoints {
            let entry = self.endpoints.entry(endpoint.clone()).or_default();
            entry.requests = entry.requests.saturating_add(slice.requests);
            entry.tokens = entry.tokens.saturating_add(slice.tokens);
            entry.cost += slice.cost;
            for (model, usage) in &slice.models {
                let nested = entry.models.entry(model.clone()).or_default();
                nested.requests = nested.requests.saturating_add(usage.requests);
                nested.tokens = nested.tokens.saturating_add(usage.tokens);
                nested.cost += usage.cost;
            }
        }
    }

    /// (requests, tokens, cost) summed over the model map.
    pub fn totals_from_models(&self) -> (u64, u64, f64) {
        self.models
            .values()
            .fold((0u64, 0u64, 0f64), |(r, t, c), s| {
                (
                    r.saturating_add(s.requests),
                    t.saturating_add(s.tokens),
                    c + s.cost,
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub breakdown: DailyBreakdown,
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub id: i64,
    pub model_pattern: String,
    pub window_minutes: i64,
    pub reset_strategy: ResetStrategy,
    pub token_limit: Option<u64>,
    pub request_limit: Option<u64>,
    pub reset_anchor: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RateLimitConfig {
    /// A config with neither limit set positive is informational only.
    pub fn is_enforced(&self) -> bool {
        self.token_limit.is_some_and(|v| v > 0) || self.request_limit.is_some_and(|v| v > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfigInput {
    pub model_pattern: String,
    pub window_minutes: i64,
    pub reset_strategy: ResetStrategy,
    pub token_limit: Option<u64>,
    pub request_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub config_id: i64,
    pub used_tokens: u64,
    pub used_requests: u64,
    pub remaining_tokens: Option<u64>,
    pub remaining_requests: Option<u64>,
    pub percentage: u64,
    pub status_label: String,
    pub window_start: String,
    pub next_reset: String,
    pub last_updated: String,
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HourlyUsage {
    pub hour: String,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub id: String,
    pub input: f64,
    pub output: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    #[serde(default)]
    pub prices: Vec<PriceEntry>,
}

impl PriceTable {
    /// Built-in fallback prices (USD per 1M tokens), keyed by model-name
    /// substrings. More specific ids come first so substring matching does
    /// not swallow them.
    pub fn builtin() -> Self {
        fn entry(id: &str, input: f64, output: f64) -> PriceEntry {
            PriceEntry {
                id: id.to_string(),
                input,
                output,
                vendor: None,
            }
        }
        PriceTable {
            prices: vec![
                entry("gpt-4o-mini", 0.15, 0.60),
                entry("gpt-4o", 2.50, 10.00),
                entry("gpt-4", 30.00, 60.00),
                entry("gpt-3.5", 0.50, 1.50),
                entry("claude-opus", 15.00, 75.00),
                entry("claude-sonnet", 3.00, 15.00),
                entry("claude-haiku", 0.80, 4.00),
                entry("gemini-flash", 0.30, 2.50),
                entry("gemini", 1.25, 10.00),
                entry("deepseek", 0.27, 1.10),
                entry("_default", 1.00, 2.00),
            ],
        }
    }

    /// Exact id first, then substring in either direction, then `_default`.
    pub fn price_for(&self, model: &str) -> Option<&PriceEntry> {
        let model = model.to_ascii_lowercase();
        if let Some(entry) = self
            .prices
            .iter()
            .find(|e| e.id.to_ascii_lowercase() == model)
        {
            return Some(entry);
        }
        if let Some(entry) = self.prices.iter().find(|e| {
            let id = e.id.to_ascii_lowercase();
            id != "_default" && (model.contains(&id) || id.contains(&model))
        }) {
            return Some(entry);
        }
        self.prices.iter().find(|e| e.id == "_default")
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.price_for(model) {
            Some(entry) => {
                (input_tokens as f64 / 1_000_000.0) * entry.input
                    + (output_tokens as f64 / 1_000_000.0) * entry.output
            }
            None => 0.0,
        }
    }
}
