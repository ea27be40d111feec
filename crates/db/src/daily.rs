use meter_core::DailyUsage;
use rusqlite::{OptionalExtension, params};

use crate::Db;
use crate::error::Result;
use crate::helpers::row_to_daily;

const DAILY_COLUMNS: &str = "date, total_requests, success_count, failure_count, total_tokens, \
     total_cost_usd, breakdown";

impl Db {
    pub fn get_daily(&self, date: &str) -> Result<Option<DailyUsage>> {
        self.conn
            .query_row(
                &format!("SELECT {DAILY_COLUMNS} FROM daily_usage WHERE date = ?1"),
                params![date],
                row_to_daily,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Daily rows with `from <= date <= to`, oldest first.
    pub fn daily_range(&self, from: &str, to: &str) -> Result<Vec<DailyUsage>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DAILY_COLUMNS} FROM daily_usage WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC"
        ))?;
        let rows = stmt
            .query_map(params![from, to], row_to_daily)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_daily(&self, daily: &DailyUsage) -> Result<()> {
        let breakdown = serde_json::to_string(&daily.breakdown)?;
        self.conn.execute(
            r#"
            INSERT INTO daily_usage (
              date, total_requests, success_count, failure_count,
              total_tokens, total_cost_usd, breakdown
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(date) DO UPDATE SET
              total_requests = excluded.total_requests,
              success_count = excluded.success_count,
              failure_count = excluded.failure_count,
              total_tokens = excluded.total_tokens,
              total_cost_usd = excluded.total_cost_usd,
              breakdown = excluded.breakdown
            "#,
            params![
                daily.date,
                daily.total_requests as i64,
                daily.success_count as i64,
                daily.failure_count as i64,
                daily.total_tokens as i64,
                daily.total_cost_usd,
                breakdown,
            ],
        )?;
        Ok(())
    }
}
