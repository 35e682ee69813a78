//! PostgreSQL implementation of DocStore
//!
//! Durable source of truth for executions, steps and cron bookkeeping.
//! Numeric fields are stored typed (BIGINT millisecond timestamps, INTEGER
//! attempt counts); JSON payloads and results are stored as their serialized
//! text, matching the engine's bytes-through contract.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, info, instrument};

use stepflow_core::{CronExecutionRecord, ExecutionRecord, ExecutionStatus, StepRecord};

use crate::docs::{DocStore, ExecutionFilter, ExecutionUpdate, SortOrder};
use crate::error::StoreError;

/// Schema + index bootstrap statements. Each is idempotent, so re-running
/// them against an existing database is success, not failure.
const ENSURE_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        event_name TEXT NOT NULL,
        event_data TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        result TEXT,
        error TEXT,
        error_stack TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS executions_status_created_at
       ON executions (status, created_at DESC)"#,
    r#"CREATE INDEX IF NOT EXISTS executions_created_at
       ON executions (created_at DESC)"#,
    r#"CREATE INDEX IF NOT EXISTS executions_event_name_created_at
       ON executions (event_name, created_at DESC)"#,
    r#"
    CREATE TABLE IF NOT EXISTS steps (
        execution_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        result TEXT NOT NULL,
        "timestamp" BIGINT NOT NULL,
        PRIMARY KEY (execution_id, step_id)
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS steps_execution_id_timestamp
       ON steps (execution_id, "timestamp" ASC)"#,
    r#"
    CREATE TABLE IF NOT EXISTS cron_executions (
        function_id TEXT PRIMARY KEY,
        last_execution_time BIGINT NOT NULL,
        next_scheduled_time BIGINT,
        cron_expression TEXT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
];

/// PostgreSQL-backed [`DocStore`].
#[derive(Clone)]
pub struct PostgresDocStore {
    pool: PgPool,
}

impl PostgresDocStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a fresh pool against `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        debug!("connected document store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, StoreError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status: {status_raw}")))?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(db_err)?;
    let result: Option<String> = row.try_get("result").map_err(db_err)?;
    let result = result
        .map(|raw| {
            serde_json::from_str::<Value>(&raw)
                .map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()?;

    Ok(ExecutionRecord {
        id: row.try_get("id").map_err(db_err)?,
        event_name: row.try_get("event_name").map_err(db_err)?,
        event_data: row.try_get("event_data").map_err(db_err)?,
        status,
        attempt_count: attempt_count.max(0) as u32,
        result,
        error: row.try_get("error").map_err(db_err)?,
        error_stack: row.try_get("error_stack").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_step(row: &sqlx::postgres::PgRow) -> Result<StepRecord, StoreError> {
    let result_raw: String = row.try_get("result").map_err(db_err)?;
    let result = serde_json::from_str(&result_raw)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(StepRecord {
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        step_id: row.try_get("step_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        status: row.try_get("status").map_err(db_err)?,
        result,
        timestamp: row.try_get("timestamp").map_err(db_err)?,
    })
}

#[async_trait]
impl DocStore for PostgresDocStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_indexes(&self, logging: bool) -> Result<(), StoreError> {
        for statement in ENSURE_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("index bootstrap failed: {}", e);
                    db_err(e)
                })?;
        }
        if logging {
            info!("document store collections and indexes ready");
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, event_name, event_data, status, attempt_count, result,
                 error, error_stack, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&record.id)
        .bind(&record.event_name)
        .bind(&record.event_data)
        .bind(record.status.as_str())
        .bind(record.attempt_count as i32)
        .bind(record.result.as_ref().map(|v| v.to_string()))
        .bind(&record.error)
        .bind(&record.error_stack)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        order: SortOrder,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM executions");
        let mut has_where = false;

        if let Some(set) = filter.status_set() {
            qb.push(" WHERE status IN (");
            let mut sep = qb.separated(", ");
            for status in set {
                sep.push_bind(status.as_str());
            }
            qb.push(")");
            has_where = true;
        }
        if let Some(event_name) = &filter.event_name {
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("event_name = ");
            qb.push_bind(event_name.clone());
        }

        qb.push(match order {
            SortOrder::Ascending => " ORDER BY created_at ASC, id ASC",
            SortOrder::Descending => " ORDER BY created_at DESC, id DESC",
        });
        if limit > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }
        if skip > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(skip);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn count_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<u64, StoreError> {
        let count: i64 = match status {
            Some(status) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM executions WHERE status = $1")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?
            }
            None => sqlx::query_scalar("SELECT COUNT(*) FROM executions")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?,
        };
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, update))]
    async fn update_execution(
        &self,
        id: &str,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE executions SET ");
        let mut sep = qb.separated(", ");
        let mut touched = false;

        if let Some(status) = update.status {
            sep.push("status = ").push_bind_unseparated(status.as_str());
            touched = true;
        }
        if let Some(attempt_count) = update.attempt_count {
            sep.push("attempt_count = ")
                .push_bind_unseparated(attempt_count as i32);
            touched = true;
        }
        if let Some(result) = &update.result {
            sep.push("result = ").push_bind_unseparated(result.to_string());
            touched = true;
        }
        if let Some(error) = &update.error {
            sep.push("error = ").push_bind_unseparated(error.clone());
            touched = true;
        }
        if let Some(error_stack) = &update.error_stack {
            sep.push("error_stack = ")
                .push_bind_unseparated(error_stack.clone());
            touched = true;
        }
        if let Some(updated_at) = update.updated_at {
            sep.push("updated_at = ").push_bind_unseparated(updated_at);
            touched = true;
        }
        if update.clear_errors {
            sep.push("error = NULL");
            sep.push("error_stack = NULL");
            touched = true;
        }
        if !touched {
            return Ok(());
        }

        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());

        let outcome = qb.build().execute(&self.pool).await.map_err(db_err)?;
        if outcome.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(execution_id = %record.execution_id, step = %record.name))]
    async fn insert_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO steps (execution_id, step_id, name, status, result, "timestamp")
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (execution_id, step_id) DO UPDATE
            SET name = EXCLUDED.name,
                status = EXCLUDED.status,
                result = EXCLUDED.result,
                "timestamp" = EXCLUDED."timestamp"
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.step_id)
        .bind(&record.name)
        .bind(&record.status)
        .bind(record.result.to_string())
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, step_id, name, status, result, "timestamp"
            FROM steps
            WHERE execution_id = $1
            ORDER BY "timestamp" ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_step).collect()
    }

    async fn upsert_cron_execution(
        &self,
        record: &CronExecutionRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cron_executions
                (function_id, last_execution_time, next_scheduled_time,
                 cron_expression, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (function_id) DO UPDATE
            SET last_execution_time = EXCLUDED.last_execution_time,
                next_scheduled_time = EXCLUDED.next_scheduled_time,
                cron_expression = EXCLUDED.cron_expression,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.function_id)
        .bind(record.last_execution_time)
        .bind(record.next_scheduled_time)
        .bind(&record.cron_expression)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_cron_execution(
        &self,
        function_id: &str,
    ) -> Result<Option<CronExecutionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT function_id, last_execution_time, next_scheduled_time,
                   cron_expression, updated_at
            FROM cron_executions
            WHERE function_id = $1
            "#,
        )
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            Ok(CronExecutionRecord {
                function_id: row.try_get("function_id").map_err(db_err)?,
                last_execution_time: row.try_get("last_execution_time").map_err(db_err)?,
                next_scheduled_time: row.try_get("next_scheduled_time").map_err(db_err)?,
                cron_expression: row.try_get("cron_expression").map_err(db_err)?,
                updated_at: row.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }
}
