//! PostgreSQL implementation of WorkflowEventStore
//!
//! Durable persistence using PostgreSQL with:
//! - Status compare-and-set under `SELECT ... FOR UPDATE`
//! - Insert-if-absent step records via `ON CONFLICT DO NOTHING`
//! - Per-queue advisory transaction locks so concurrent dispatchers never
//!   exceed a queue's concurrency limit
//! - `SKIP LOCKED` claiming of due wake-ups

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;
use crate::step::StepError;
use crate::workflow::WorkflowError;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const INSTANCE_COLUMNS: &str = "id, workflow_type, status, input, result, error, queue_name, \
     parent_id, app_version, executor_id, resume_at, created_at, started_at, completed_at";

/// PostgreSQL implementation of WorkflowEventStore
///
/// Uses a connection pool; safe to share between any number of executors
/// pointed at the same database.
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::PostgresWorkflowEventStore;
///
/// let store = PostgresWorkflowEventStore::connect("postgres://localhost/app", None, None, 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool; explicit credentials override those in the URL
    pub async fn connect(
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let mut options = PgConnectOptions::from_str(url).map_err(db_error)?;
        if let Some(user) = user {
            options = options.username(user);
        }
        if let Some(password) = password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                db_error(e)
            })?;

        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        info!("Durable schema is up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_instance(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        workflow: &NewWorkflow,
        queue_name: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_workflow_instances
                (id, workflow_type, status, input, queue_name, parent_id, app_version, executor_id)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.workflow_type)
        .bind(&workflow.input)
        .bind(queue_name)
        .bind(workflow.parent_id)
        .bind(&workflow.app_version)
        .bind(&workflow.executor_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| instance_error(e, workflow.id))?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        self.insert_instance(&mut tx, &workflow, None).await?;
        tx.commit().await.map_err(db_error)?;

        debug!(workflow_type = %workflow.workflow_type, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM durable_workflow_instances WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::UnknownInstance(workflow_id))?;

        let status: String = row.try_get("status").map_err(db_error)?;
        status.parse()
    }

    #[instrument(skip(self))]
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM durable_workflow_instances WHERE id = $1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::UnknownInstance(workflow_id))?;

        workflow_from_row(&row)
    }

    #[instrument(skip(self, transition), fields(to = %transition.target()))]
    async fn transition_workflow(
        &self,
        workflow_id: Uuid,
        from: &[WorkflowStatus],
        transition: Transition,
    ) -> Result<(), StoreError> {
        let to = transition.target();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query("SELECT status FROM durable_workflow_instances WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::UnknownInstance(workflow_id))?;
        let current: WorkflowStatus = row.try_get::<String, _>("status").map_err(db_error)?.parse()?;

        if !from.contains(&current) || !current.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                workflow_id,
                from: current,
                to,
            });
        }

        match transition {
            Transition::Start { executor_id } => {
                sqlx::query(
                    r#"
                    UPDATE durable_workflow_instances
                    SET status = 'running', executor_id = $2, started_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(workflow_id)
                .bind(&executor_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
            Transition::Complete(result) => {
                sqlx::query(
                    r#"
                    UPDATE durable_workflow_instances
                    SET status = 'completed', result = $2, resume_at = NULL, completed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(workflow_id)
                .bind(&result)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
            Transition::Fail(error) => {
                let error_json = serde_json::to_value(&error)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                sqlx::query(
                    r#"
                    UPDATE durable_workflow_instances
                    SET status = 'failed', error = $2, resume_at = NULL, completed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(workflow_id)
                .bind(&error_json)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
            Transition::Cancel => {
                sqlx::query(
                    r#"
                    UPDATE durable_workflow_instances
                    SET status = 'cancelled', resume_at = NULL, completed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(workflow_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
        }

        sqlx::query("DELETE FROM durable_queue_entries WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(%workflow_id, from = %current, %to, "transitioned workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM durable_workflow_instances
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR workflow_type = $2)
              AND ($3::text IS NULL OR queue_name = $3)
              AND ($4::uuid IS NULL OR parent_id = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.workflow_type)
        .bind(&filter.queue_name)
        .bind(filter.parent_id)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self, record), fields(workflow_id = %record.workflow_id, step_index = record.step_index))]
    async fn record_step(&self, record: StepRecord) -> Result<StepRecord, StoreError> {
        let error_json = record
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO durable_workflow_steps
                (workflow_id, step_index, step_name, kind, status, output, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (workflow_id, step_index) DO NOTHING
            "#,
        )
        .bind(record.workflow_id)
        .bind(record.step_index)
        .bind(&record.step_name)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(&record.output)
        .bind(&error_json)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| instance_error(e, record.workflow_id))?
        .rows_affected();

        if inserted == 1 {
            return Ok(record);
        }

        debug!("step already recorded, returning stored outcome");
        let row = sqlx::query(
            r#"
            SELECT workflow_id, step_index, step_name, kind, status, output, error, recorded_at
            FROM durable_workflow_steps
            WHERE workflow_id = $1 AND step_index = $2
            "#,
        )
        .bind(record.workflow_id)
        .bind(record.step_index)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        step_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn load_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, step_index, step_name, kind, status, output, error, recorded_at
            FROM durable_workflow_steps
            WHERE workflow_id = $1
            ORDER BY step_index
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load steps: {}", e);
            db_error(e)
        })?;

        if rows.is_empty() {
            // Distinguish "no steps yet" from "no such instance"
            self.get_workflow_status(workflow_id).await?;
        }

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn enqueue_workflow(
        &self,
        workflow: NewWorkflow,
        queue_name: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        self.insert_instance(&mut tx, &workflow, Some(queue_name)).await?;

        sqlx::query(
            r#"
            INSERT INTO durable_queue_entries (queue_name, workflow_id, status)
            VALUES ($1, $2, 'waiting')
            "#,
        )
        .bind(queue_name)
        .bind(workflow.id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(queue = %queue_name, "enqueued workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dispatch_queued(
        &self,
        queue_name: &str,
        concurrency: Option<u32>,
        executor_id: &str,
        app_version: &str,
        max: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Serialize dispatchers of the same queue for the rest of the transaction
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(queue_name)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let budget = match concurrency {
            Some(limit) => {
                let row = sqlx::query(
                    r#"
                    SELECT
                        (SELECT COUNT(*) FROM durable_queue_entries
                          WHERE queue_name = $1 AND status = 'dispatched')
                      + (SELECT COUNT(*) FROM durable_workflow_instances
                          WHERE queue_name = $1 AND status = 'running') AS active
                    "#,
                )
                .bind(queue_name)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error)?;

                let active: i64 = row.try_get("active").map_err(db_error)?;
                (i64::from(limit) - active).max(0).min(max as i64)
            }
            None => max as i64,
        };

        if budget == 0 {
            tx.commit().await.map_err(db_error)?;
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            UPDATE durable_queue_entries
            SET status = 'dispatched', executor_id = $2
            WHERE sequence IN (
                SELECT e.sequence
                FROM durable_queue_entries e
                JOIN durable_workflow_instances w ON w.id = e.workflow_id
                WHERE e.queue_name = $1
                  AND e.status = 'waiting'
                  AND w.app_version = $3
                ORDER BY e.sequence
                LIMIT $4
                FOR UPDATE OF e SKIP LOCKED
            )
            RETURNING workflow_id, sequence
            "#,
        )
        .bind(queue_name)
        .bind(executor_id)
        .bind(app_version)
        .bind(budget)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        let mut dispatched = Vec::with_capacity(rows.len());
        for row in &rows {
            let sequence: i64 = row.try_get("sequence").map_err(db_error)?;
            let workflow_id: Uuid = row.try_get("workflow_id").map_err(db_error)?;
            dispatched.push((sequence, workflow_id));
        }
        dispatched.sort_unstable();

        if !dispatched.is_empty() {
            debug!(count = dispatched.len(), "dispatched queue entries");
        }
        Ok(dispatched.into_iter().map(|(_, id)| id).collect())
    }

    #[instrument(skip(self))]
    async fn list_queue_entries(&self, queue_name: &str) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT queue_name, workflow_id, status, sequence, enqueued_at, executor_id
            FROM durable_queue_entries
            WHERE queue_name = $1
            ORDER BY sequence
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                Ok(QueueEntry {
                    queue_name: row.try_get("queue_name").map_err(db_error)?,
                    workflow_id: row.try_get("workflow_id").map_err(db_error)?,
                    status: row
                        .try_get::<String, _>("status")
                        .map_err(db_error)?
                        .parse()?,
                    sequence: row.try_get("sequence").map_err(db_error)?,
                    enqueued_at: row.try_get("enqueued_at").map_err(db_error)?,
                    executor_id: row.try_get("executor_id").map_err(db_error)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn suspend_workflow(
        &self,
        workflow_id: Uuid,
        resume_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE durable_workflow_instances
            SET resume_at = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(workflow_id)
        .bind(resume_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();

        if updated == 0 {
            let from = self.get_workflow_status(workflow_id).await?;
            return Err(StoreError::InvalidTransition {
                workflow_id,
                from,
                to: WorkflowStatus::Running,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_due_workflows(
        &self,
        executor_id: &str,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_workflow_instances
            SET resume_at = NULL
            WHERE id IN (
                SELECT id
                FROM durable_workflow_instances
                WHERE status = 'running'
                  AND executor_id = $1
                  AND resume_at <= $2
                ORDER BY resume_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(executor_id)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| row.try_get("id").map_err(db_error))
            .collect()
    }

    #[instrument(skip(self))]
    async fn recover_workflows(
        &self,
        executor_id: &str,
        app_version: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let requeued = sqlx::query(
            r#"
            UPDATE durable_queue_entries
            SET status = 'waiting', executor_id = NULL
            WHERE executor_id = $1 AND status = 'dispatched'
            "#,
        )
        .bind(executor_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();

        let rows = sqlx::query(
            r#"
            SELECT id
            FROM durable_workflow_instances
            WHERE executor_id = $1
              AND app_version = $2
              AND resume_at IS NULL
              AND (status = 'running' OR (status = 'pending' AND queue_name IS NULL))
            ORDER BY created_at, id
            "#,
        )
        .bind(executor_id)
        .bind(app_version)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(requeued, recovered = rows.len(), "recovered executor state");
        rows.iter()
            .map(|row| row.try_get("id").map_err(db_error))
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!("connection pool closed");
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Map constraint violations on instance-keyed writes to store errors
fn instance_error(e: sqlx::Error, workflow_id: Uuid) -> StoreError {
    let code = e
        .as_database_error()
        .and_then(|d| d.code())
        .map(|c| c.into_owned());

    match code.as_deref() {
        Some(UNIQUE_VIOLATION) => StoreError::DuplicateInstance(workflow_id),
        Some(FOREIGN_KEY_VIOLATION) => StoreError::UnknownInstance(workflow_id),
        _ => db_error(e),
    }
}

fn workflow_from_row(row: &PgRow) -> Result<WorkflowInfo, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(db_error)?;
    let error = error
        .map(serde_json::from_value::<WorkflowError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(WorkflowInfo {
        id: row.try_get("id").map_err(db_error)?,
        workflow_type: row.try_get("workflow_type").map_err(db_error)?,
        status: status.parse()?,
        input: row.try_get("input").map_err(db_error)?,
        result: row.try_get("result").map_err(db_error)?,
        error,
        queue_name: row.try_get("queue_name").map_err(db_error)?,
        parent_id: row.try_get("parent_id").map_err(db_error)?,
        app_version: row.try_get("app_version").map_err(db_error)?,
        executor_id: row.try_get("executor_id").map_err(db_error)?,
        resume_at: row.try_get("resume_at").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        started_at: row.try_get("started_at").map_err(db_error)?,
        completed_at: row.try_get("completed_at").map_err(db_error)?,
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord, StoreError> {
    let kind: String = row.try_get("kind").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(db_error)?;
    let error = error
        .map(serde_json::from_value::<StepError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(StepRecord {
        workflow_id: row.try_get("workflow_id").map_err(db_error)?,
        step_index: row.try_get("step_index").map_err(db_error)?,
        step_name: row.try_get("step_name").map_err(db_error)?,
        kind: kind.parse()?,
        status: status.parse()?,
        output: row.try_get("output").map_err(db_error)?,
        error,
        recorded_at: row.try_get("recorded_at").map_err(db_error)?,
    })
}
