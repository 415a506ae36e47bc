//! Persisted per-server health snapshots and the operations audit trail.

use common::now_epoch;
use sqlx::any::AnyRow;

use crate::error::Result;
use crate::{col_f64, col_opt_i64, col_text, Arg, Store};

#[derive(Debug, Clone)]
pub struct ServerHealthRow {
    pub server_id: String,
    pub response_time_ema: f64,
    pub failure_rate_ema: f64,
    pub last_success: Option<i64>,
    pub last_failure: Option<i64>,
    pub unhealthy_since: Option<i64>,
}

fn health_from_row(row: &AnyRow) -> Result<ServerHealthRow> {
    Ok(ServerHealthRow {
        server_id: col_text(row, "server_id")?,
        response_time_ema: col_f64(row, "response_time_ema")?,
        failure_rate_ema: col_f64(row, "failure_rate_ema")?,
        last_success: col_opt_i64(row, "last_success")?,
        last_failure: col_opt_i64(row, "last_failure")?,
        unhealthy_since: col_opt_i64(row, "unhealthy_since")?,
    })
}

impl Store {
    pub async fn upsert_server_health(&self, health: &ServerHealthRow) -> Result<()> {
        self.execute(
            "INSERT INTO server_health (server_id, response_time_ema, failure_rate_ema, \
                last_success, last_failure, unhealthy_since, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) \
             ON CONFLICT (server_id) DO UPDATE SET \
                response_time_ema = EXCLUDED.response_time_ema, \
                failure_rate_ema = EXCLUDED.failure_rate_ema, \
                last_success = EXCLUDED.last_success, \
                last_failure = EXCLUDED.last_failure, \
                unhealthy_since = EXCLUDED.unhealthy_since, \
                updated_at = EXCLUDED.updated_at",
            &[
                Arg::from(health.server_id.clone()),
                Arg::Real(health.response_time_ema),
                Arg::Real(health.failure_rate_ema),
                Arg::from(health.last_success),
                Arg::from(health.last_failure),
                Arg::from(health.unhealthy_since),
                Arg::from(now_epoch()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn server_health(&self, server_id: &str) -> Result<Option<ServerHealthRow>> {
        let row = self
            .fetch_optional(
                "SELECT server_id, response_time_ema, failure_rate_ema, last_success, \
                    last_failure, unhealthy_since FROM server_health WHERE server_id = $1",
                &[Arg::from(server_id)],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(health_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn begin_operation(&self, operation_id: &str, name: &str, entity_id: Option<&str>) -> Result<()> {
        self.execute(
            "INSERT INTO operations (operation_id, entity_id, operation_name, state, started_at) \
             VALUES ($1,$2,$3,'started',$4)",
            &[
                Arg::from(operation_id),
                Arg::OptText(entity_id.map(String::from)),
                Arg::from(name),
                Arg::from(now_epoch()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn complete_operation(&self, operation_id: &str, duration_ms: u64) -> Result<()> {
        self.execute(
            "UPDATE operations SET state = 'completed', duration_ms = $1, completed_at = $2 \
             WHERE operation_id = $3",
            &[
                Arg::from(duration_ms),
                Arg::from(now_epoch()),
                Arg::from(operation_id),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn fail_operation(&self, operation_id: &str, error: &str) -> Result<()> {
        self.execute(
            "UPDATE operations SET state = 'failed', error = $1, completed_at = $2 \
             WHERE operation_id = $3",
            &[
                Arg::from(error),
                Arg::from(now_epoch()),
                Arg::from(operation_id),
            ],
        )
        .await?;
        Ok(())
    }
}
