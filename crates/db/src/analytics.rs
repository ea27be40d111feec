use std::collections::{BTreeMap, HashMap};

use meter_core::{EndpointUsage, HourlyUsage, parse_ts, tz_offset};
use rusqlite::params;

use crate::Db;
use crate::error::Result;
use crate::helpers::delta_counts;

/// Cumulative reading of one (endpoint, model) key at one capture time.
struct KeyedReading {
    api_endpoint: String,
    model_name: String,
    captured_at: String,
    requests: u64,
    tokens: u64,
    cost: f64,
}

impl Db {
    /// Usage per local hour, derived by walking each (endpoint, model)
    /// key's cumulative readings and bucketing the increments.
    pub fn hourly_usage(&self, lo: &str, hi: &str, offset_hours: i32) -> Result<Vec<HourlyUsage>> {
        let readings = self.keyed_readings(lo, hi)?;
        let tz = tz_offset(offset_hours);
        let mut buckets: BTreeMap<String, (u64, u64, f64)> = BTreeMap::new();
        let mut prev_by_key: HashMap<(String, String), (u64, u64, f64)> = HashMap::new();
        for reading in readings {
            let key = (reading.api_endpoint.clone(), reading.model_name.clone());
            let current = (reading.requests, reading.tokens, reading.cost);
            let delta = delta_counts(prev_by_key.get(&key), current);
            prev_by_key.insert(key, current);
            let hour = parse_ts(&reading.captured_at)?
                .with_timezone(&tz)
                .format("%Y-%m-%dT%H:00:00%:z")
                .to_string();
            let entry = buckets.entry(hour).or_insert((0, 0, 0.0));
            entry.0 = entry.0.saturating_add(delta.0);
            entry.1 = entry.1.saturating_add(delta.1);
            entry.2 += delta.2;
        }
        Ok(buckets
            .into_iter()
            .map(|(hour, (requests, tokens, cost))| HourlyUsage {
                hour,
                requests,
                tokens,
                cost,
            })
            .collect())
    }

    /// Per-endpoint usage over a time range, busiest endpoints first.
    pub fn endpoint_usage(&self, lo: &str, hi: &str) -> Result<Vec<EndpointUsage>> {
        let readings = self.keyed_readings(lo, hi)?;
        let mut totals: HashMap<String, (u64, u64, f64)> = HashMap::new();
        let mut prev_by_key: HashMap<(String, String), (u64, u64, f64)> = HashMap::new();
        for reading in readings {
            let key = (reading.api_endpoint.clone(), reading.model_name.clone());
            let current = (reading.requests, reading.tokens, reading.cost);
            let delta = delta_counts(prev_by_key.get(&key), current);
            prev_by_key.insert(key, current);
            let entry = totals.entry(reading.api_endpoint).or_insert((0, 0, 0.0));
            entry.0 = entry.0.saturating_add(delta.0);
            entry.1 = entry.1.saturating_add(delta.1);
            entry.2 += delta.2;
        }
        let mut result: Vec<EndpointUsage> = totals
            .into_iter()
            .map(|(endpoint, (requests, tokens, cost))| EndpointUsage {
                endpoint,
                requests,
                tokens,
                cost,
            })
            .collect();
        result.sort_by(|a, b| b.requests.cmp(&a.requests));
        Ok(result)
    }

    fn keyed_readings(&self, lo: &str, hi: &str) -> Result<Vec<KeyedReading>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT api_endpoint, model_name, captured_at, request_count,
                   total_tokens, estimated_cost_usd
            FROM model_usage
            WHERE captured_at >= ?1 AND captured_at < ?2
            ORDER BY api_endpoint ASC, model_name ASC, captured_at ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![lo, hi], |row| {
                Ok(KeyedReading {
                    api_endpoint: row.get(0)?,
                    model_name: row.get(1)?,
                    captured_at: row.get(2)?,
                    requests: row.get::<_, i64>(3)? as u64,
                    tokens: row.get::<_, i64>(4)? as u64,
                    cost: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
