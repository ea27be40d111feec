use std::env;
use std::path::PathBuf;
use std::time::Duration;

use meter_engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub cliproxy_url: String,
    pub management_key: Option<String>,
    pub interval: Duration,
    pub trigger_port: u16,
    pub timezone_offset_hours: i32,
    pub db_path: PathBuf,
    pub pricing_url: Option<String>,
    pub pricing_ttl: Duration,
    pub false_start_cost_threshold: f64,
    pub false_start_cost_tolerance: f64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        Self {
            cliproxy_url: env::var("CLIPROXY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8317".to_string()),
            management_key: env::var("CLIPROXY_MANAGEMENT_KEY")
                .ok()
                .filter(|value| !value.is_empty()),
            interval: Duration::from_secs(parse_env("COLLECTOR_INTERVAL_SECONDS", 300u64)),
            trigger_port: parse_env("COLLECTOR_TRIGGER_PORT", 5001u16),
            timezone_offset_hours: parse_env("TIMEZONE_OFFSET_HOURS", 7i32),
            db_path: env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cliproxy-meter.sqlite")),
            pricing_url: env::var("PRICING_URL").ok().filter(|value| !value.is_empty()),
            pricing_ttl: Duration::from_secs(3600),
            false_start_cost_threshold: parse_env(
                "FALSE_START_COST_THRESHOLD",
                defaults.false_start_cost_threshold,
            ),
            false_start_cost_tolerance: parse_env(
                "FALSE_START_COST_TOLERANCE",
                defaults.false_start_cost_tolerance,
            ),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            timezone_offset_hours: self.timezone_offset_hours,
            false_start_cost_threshold: self.false_start_cost_threshold,
            false_start_cost_tolerance: self.false_start_cost_tolerance,
            ..EngineConfig::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
