/// Tunables for the delta engine and the reconciler.
///
/// The false-start thresholds mirror the upstream proxy's observed
/// behaviour when a model's whole history first shows up in one report;
/// they are deliberately overridable rather than baked in.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub timezone_offset_hours: i32,
    /// A per-key cost delta above this (USD) is a false-start candidate.
    pub false_start_cost_threshold: f64,
    /// ...when it also matches the key's cumulative cost within this much.
    pub false_start_cost_tolerance: f64,
    /// Reconciler variant of the same filter, in tokens.
    pub false_start_token_threshold: u64,
    pub false_start_token_tolerance: u64,
    /// Baseline-to-first-inner gaps beyond this get an interpolated
    /// baseline at the window boundary.
    pub gap_threshold_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone_offset_hours: 7,
            false_start_cost_threshold: 10.0,
            false_start_cost_tolerance: 0.1,
            false_start_token_threshold: 100_000,
            false_start_token_tolerance: 100,
            gap_threshold_minutes: 30,
        }
    }
}
