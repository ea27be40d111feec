use meter_core::{RateLimitConfig, RateLimitConfigInput, RateLimitStatus};
use rusqlite::{OptionalExtension, params};

use crate::Db;
use crate::error::{DbError, Result};
use crate::helpers::{row_to_limit_config, row_to_limit_status};

const CONFIG_COLUMNS: &str = "id, model_pattern, window_minutes, reset_strategy, token_limit, \
     request_limit, reset_anchor, created_at, updated_at";

const STATUS_COLUMNS: &str = "config_id, used_tokens, used_requests, remaining_tokens, \
     remaining_requests, percentage, status_label, window_start, next_reset, last_updated";

impl Db {
    pub fn list_limit_configs(&self) -> Result<Vec<RateLimitConfig>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFIG_COLUMNS} FROM rate_limit_config ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map([], row_to_limit_config)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_limit_config(&self, id: i64) -> Result<Option<RateLimitConfig>> {
        self.conn
            .query_row(
                &format!("SELECT {CONFIG_COLUMNS} FROM rate_limit_config WHERE id = ?1"),
                params![id],
                row_to_limit_config,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_limit_config(
        &self,
        input: &RateLimitConfigInput,
        now: &str,
    ) -> Result<RateLimitConfig> {
        self.conn.execute(
            r#"
            INSERT INTO rate_limit_config (
              model_pattern, window_minutes, reset_strategy,
              token_limit, request_limit, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                input.model_pattern,
                input.window_minutes,
                input.reset_strategy.as_str(),
                input.token_limit.map(|v| v as i64),
                input.request_limit.map(|v| v as i64),
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_limit_config(id)?
            .ok_or(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn update_limit_config(
        &self,
        id: i64,
        input: &RateLimitConfigInput,
        now: &str,
    ) -> Result<Option<RateLimitConfig>> {
        let updated = self.conn.execute(
            r#"
            UPDATE rate_limit_config SET
              model_pattern = ?1,
              window_minutes = ?2,
              reset_strategy = ?3,
              token_limit = ?4,
              request_limit = ?5,
              updated_at = ?6
            WHERE id = ?7
            "#,
            params![
                input.model_pattern,
                input.window_minutes,
                input.reset_strategy.as_str(),
                input.token_limit.map(|v| v as i64),
                input.request_limit.map(|v| v as i64),
                now,
                id,
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_limit_config(id)
    }

    /// Manual resets advance the effective window start by stamping the
    /// config; the reconciler honours the stamp until it naturally expires.
    pub fn set_reset_anchor(&self, id: i64, anchor: &str, now: &str) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE rate_limit_config SET reset_anchor = ?1, updated_at = ?2 WHERE id = ?3",
            params![anchor, now, id],
        )?;
        Ok(updated > 0)
    }

    pub fn upsert_limit_status(&self, status: &RateLimitStatus) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO rate_limit_status (
              config_id, used_tokens, used_requests, remaining_tokens,
              remaining_requests, percentage, status_label, window_start,
              next_reset, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(config_id) DO UPDATE SET
              used_tokens = excluded.used_tokens,
              used_requests = excluded.used_requests,
              remaining_tokens = excluded.remaining_tokens,
              remaining_requests = excluded.remaining_requests,
              percentage = excluded.percentage,
              status_label = excluded.status_label,
              window_start = excluded.window_start,
              next_reset = excluded.next_reset,
              last_updated = excluded.last_updated
            "#,
            params![
                status.config_id,
                status.used_tokens as i64,
                status.used_requests as i64,
                status.remaining_tokens.map(|v| v as i64),
                status.remaining_requests.map(|v| v as i64),
                status.percentage as i64,
                status.status_label,
                status.window_start,
                status.next_reset,
                status.last_updated,
            ],
        )?;
        Ok(())
    }

    pub fn get_limit_status(&self, config_id: i64) -> Result<Option<RateLimitStatus>> {
        self.conn
            .query_row(
                &format!("SELECT {STATUS_COLUMNS} FROM rate_limit_status WHERE config_id = ?1"),
                params![config_id],
                row_to_limit_status,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_limit_statuses(&self) -> Result<Vec<RateLimitStatus>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STATUS_COLUMNS} FROM rate_limit_status ORDER BY config_id ASC"
        ))?;
        let rows = stmt
            .query_map([], row_to_limit_status)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
