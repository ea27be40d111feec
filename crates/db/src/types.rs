use meter_core::{DailyUsage, NewModelUsage};

#[derive(Debug, Clone, Copy)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Counters for a snapshot about to be recorded.
#[derive(Debug, Clone, Default)]
pub struct NewSnapshot {
    pub captured_at: String,
    pub raw_json: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_tokens: u64,
}

/// Everything one collection pass persists, committed in a single
/// transaction so a failed pass leaves no partial snapshot behind.
#[derive(Debug)]
pub struct PassWrite<'a> {
    pub snapshot: &'a NewSnapshot,
    pub cumulative_cost_usd: f64,
    pub rows: &'a [NewModelUsage],
    pub daily: &'a DailyUsage,
}
