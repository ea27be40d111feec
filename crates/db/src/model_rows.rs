use meter_core::ModelUsageRow;
use rusqlite::{OptionalExtension, params};

use crate::Db;
use crate::error::Result;
use crate::helpers::row_to_model_usage;
use crate::types::SortOrder;

const MODEL_USAGE_COLUMNS: &str = "id, snapshot_id, api_endpoint, model_name, request_count, \
     input_tokens, output_tokens, total_tokens, estimated_cost_usd, captured_at";

fn like_pattern(pattern: &str) -> String {
    format!("%{}%", pattern)
}

impl Db {
    /// Capture time of the most recent row matching the pattern.
    pub fn latest_row_time(&self, pattern: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                r#"
                SELECT captured_at
                FROM model_usage
                WHERE model_name LIKE ?1
                ORDER BY captured_at DESC
                LIMIT 1
                "#,
                params![like_pattern(pattern)],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Capture time of the newest matching row strictly before `before`.
    pub fn last_row_time_before(&self, pattern: &str, before: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                r#"
                SELECT captured_at
                FROM model_usage
                WHERE model_name LIKE ?1 AND captured_at < ?2
                ORDER BY captured_at DESC
                LIMIT 1
                "#,
                params![like_pattern(pattern), before],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Capture time of the oldest matching row at or after `at`.
    pub fn first_row_time_at_or_after(&self, pattern: &str, at: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                r#"
                SELECT captured_at
                FROM model_usage
                WHERE model_name LIKE ?1 AND captured_at >= ?2
                ORDER BY captured_at ASC
                LIMIT 1
                "#,
                params![like_pattern(pattern), at],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// All matching rows captured at exactly `captured_at` (one snapshot).
    pub fn rows_at(&self, pattern: &str, captured_at: &str) -> Result<Vec<ModelUsageRow>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {MODEL_USAGE_COLUMNS}
            FROM model_usage
            WHERE model_name LIKE ?1 AND captured_at = ?2
            ORDER BY api_endpoint ASC, model_name ASC
            "#
        ))?;
        let rows = stmt
            .query_map(params![like_pattern(pattern), captured_at], row_to_model_usage)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pattern + half-open time-range query with explicit sort order and an
    /// optional row cap.
    pub fn rows_in_range(
        &self,
        pattern: Option<&str>,
        lo: &str,
        hi: &str,
        order: SortOrder,
        limit: Option<u32>,
    ) -> Result<Vec<ModelUsageRow>> {
        let mut sql = format!(
            "SELECT {MODEL_USAGE_COLUMNS} FROM model_usage WHERE captured_at >= ?1 AND captured_at < ?2"
        );
        if pattern.is_some() {
            sql.push_str(" AND model_name LIKE ?3");
        }
        sql.push_str(match order {
            SortOrder::Asc => " ORDER BY captured_at ASC",
            SortOrder::Desc => " ORDER BY captured_at DESC",
        });
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if let Some(pattern) = pattern {
            stmt.query_map(params![lo, hi, like_pattern(pattern)], row_to_model_usage)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![lo, hi], row_to_model_usage)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }
}
