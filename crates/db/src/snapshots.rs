use meter_core::{ModelUsageRow, Snapshot};
use rusqlite::{OptionalExtension, params};

use crate::Db;
use crate::error::Result;
use crate::helpers::{row_to_model_usage, row_to_snapshot};
use crate::types::PassWrite;

const SNAPSHOT_COLUMNS: &str = "id, captured_at, total_requests, success_count, failure_count, \
     total_tokens, cumulative_cost_usd";

impl Db {
    /// Persist one collection pass: the snapshot, its per-model rows, the
    /// finalised cumulative cost, and the merged daily row, atomically.
    pub fn commit_pass(&mut self, write: &PassWrite<'_>) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO snapshot (
              captured_at, raw_json, total_requests, success_count,
              failure_count, total_tokens, cumulative_cost_usd
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
            "#,
            params![
                write.snapshot.captured_at,
                write.snapshot.raw_json,
                write.snapshot.total_requests as i64,
                write.snapshot.success_count as i64,
                write.snapshot.failure_count as i64,
                write.snapshot.total_tokens as i64,
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO model_usage (
                  snapshot_id, api_endpoint, model_name, request_count,
                  input_tokens, output_tokens, total_tokens,
                  estimated_cost_usd, captured_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for row in write.rows {
                stmt.execute(params![
                    snapshot_id,
                    row.api_endpoint,
                    row.model_name,
                    row.request_count as i64,
                    row.input_tokens as i64,
                    row.output_tokens as i64,
                    row.total_tokens as i64,
                    row.estimated_cost_usd,
                    write.snapshot.captured_at,
                ])?;
            }
        }
        // Cost is finalised only after every model row is in place.
        tx.execute(
            "UPDATE snapshot SET cumulative_cost_usd = ?1 WHERE id = ?2",
            params![write.cumulative_cost_usd, snapshot_id],
        )?;

        let daily = write.daily;
        let breakdown = serde_json::to_string(&daily.breakdown)?;
        tx.execute(
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
        tx.commit()?;
        Ok(snapshot_id)
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        self.conn
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshot ORDER BY id DESC LIMIT 1"),
                [],
                row_to_snapshot,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Second-latest snapshot, i.e. the predecessor of the row just written.
    pub fn previous_snapshot(&self) -> Result<Option<Snapshot>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM snapshot ORDER BY id DESC LIMIT 1 OFFSET 1"
                ),
                [],
                row_to_snapshot,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn model_rows_for_snapshot(&self, snapshot_id: i64) -> Result<Vec<ModelUsageRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, snapshot_id, api_endpoint, model_name, request_count,
                   input_tokens, output_tokens, total_tokens,
                   estimated_cost_usd, captured_at
            FROM model_usage
            WHERE snapshot_id = ?1
            ORDER BY api_endpoint ASC, model_name ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![snapshot_id], row_to_model_usage)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn snapshot_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM snapshot", [], |row| row.get(0))
            .map_err(Into::into)
    }
}
