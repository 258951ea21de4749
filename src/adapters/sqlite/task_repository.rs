//! SQLite implementation of `Repository<Task>`.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_json, parse_optional_datetime};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::{Atomicity, Backoff, LogEntry, StepResult, StepSpec, TaskStatus};
use crate::domain::models::{AuditFields, Task};
use crate::domain::ports::persistence::{Condition, ConditionValue, OrderDirection, Query, Repository};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Append a `Condition` as a `WHERE` fragment onto `builder`. Pattern-matches
/// the condition AST into the column it targets; every column this crate's
/// queries actually filter on (status, id, scheduled_to, next_run_at,
/// lease_expiry) is covered, an unmapped attribute is a logic error in the
/// caller rather than data to sanitize against.
fn push_condition<'a>(builder: &mut QueryBuilder<'a, Sqlite>, condition: &'a Condition) {
    match condition {
        Condition::Eq(field, value) => push_cmp(builder, field, "=", value),
        Condition::Gt(field, value) => push_cmp(builder, field, ">", value),
        Condition::Lt(field, value) => push_cmp(builder, field, "<", value),
        Condition::Gte(field, value) => push_cmp(builder, field, ">=", value),
        Condition::Lte(field, value) => push_cmp(builder, field, "<=", value),
        Condition::In(field, values) => {
            builder.push(format!("{field} IN ("));
            let mut separated = builder.separated(", ");
            for value in values {
                separated.push_bind(condition_value_bind(value));
            }
            builder.push(")");
        }
        Condition::And(a, b) => {
            builder.push("(");
            push_condition(builder, a);
            builder.push(" AND ");
            push_condition(builder, b);
            builder.push(")");
        }
        Condition::Or(a, b) => {
            builder.push("(");
            push_condition(builder, a);
            builder.push(" OR ");
            push_condition(builder, b);
            builder.push(")");
        }
        Condition::Not(inner) => {
            builder.push("NOT (");
            push_condition(builder, inner);
            builder.push(")");
        }
    }
}

fn push_cmp<'a>(builder: &mut QueryBuilder<'a, Sqlite>, field: &str, op: &str, value: &'a ConditionValue) {
    builder.push(format!("{field} {op} "));
    builder.push_bind(condition_value_bind(value));
}

fn condition_value_bind(value: &ConditionValue) -> String {
    match value {
        ConditionValue::Str(s) => s.clone(),
        ConditionValue::Timestamp(ts) => format_datetime(ts),
        ConditionValue::Uuid(id) => id.to_string(),
    }
}

#[async_trait]
impl Repository<Task> for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        let input = serde_json::to_string(&task.input)?;
        let output = task.output.as_ref().map(serde_json::to_string).transpose()?;
        let error = task.error.as_ref().map(serde_json::to_string).transpose()?;
        let backoff = serde_json::to_string(&task.backoff)?;
        let steps = serde_json::to_string(&task.steps)?;
        let step_results = serde_json::to_string(&task.step_results)?;
        let log_tail = serde_json::to_string(&task.log_tail)?;

        sqlx::query(
            r#"INSERT INTO tasks (id, classification, atomicity, status, input, output, error,
               attempt, max_attempts, backoff, next_run_at, scheduled_to, lease_owner, lease_expiry,
               steps, current_step, step_results, log_tail, log_tail_max,
               created_at, updated_at, created_by, updated_by, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.classification)
        .bind(atomicity_str(task.atomicity))
        .bind(task.status.as_str())
        .bind(&input)
        .bind(&output)
        .bind(&error)
        .bind(task.attempt as i64)
        .bind(task.max_attempts as i64)
        .bind(&backoff)
        .bind(task.next_run_at.as_ref().map(format_datetime))
        .bind(task.scheduled_to.as_ref().map(format_datetime))
        .bind(&task.lease_owner)
        .bind(task.lease_expiry.as_ref().map(format_datetime))
        .bind(&steps)
        .bind(task.current_step as i64)
        .bind(&step_results)
        .bind(&log_tail)
        .bind(task.log_tail_max as i64)
        .bind(format_datetime(&task.audit.created_at))
        .bind(format_datetime(&task.audit.updated_at))
        .bind(&task.audit.created_by)
        .bind(&task.audit.updated_by)
        .bind(task.version as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn read(&self, id: Uuid) -> DomainResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(DomainError::TaskNotFound(id))?.try_into()
    }

    /// Compare-and-set: the `WHERE id = ? AND version = ?` clause only
    /// matches the row this caller last read. Zero rows affected means
    /// someone else claimed or updated it first.
    async fn update(&self, task: &Task) -> DomainResult<()> {
        let output = task.output.as_ref().map(serde_json::to_string).transpose()?;
        let error = task.error.as_ref().map(serde_json::to_string).transpose()?;
        let backoff = serde_json::to_string(&task.backoff)?;
        let steps = serde_json::to_string(&task.steps)?;
        let step_results = serde_json::to_string(&task.step_results)?;
        let log_tail = serde_json::to_string(&task.log_tail)?;
        let prior_version = task.version.saturating_sub(1).max(1);

        let result = sqlx::query(
            r#"UPDATE tasks SET classification = ?, atomicity = ?, status = ?, input = ?,
               output = ?, error = ?, attempt = ?, max_attempts = ?, backoff = ?,
               next_run_at = ?, scheduled_to = ?, lease_owner = ?, lease_expiry = ?,
               steps = ?, current_step = ?, step_results = ?, log_tail = ?, log_tail_max = ?,
               updated_at = ?, updated_by = ?, version = ?
               WHERE id = ? AND version IN (?, ?)"#,
        )
        .bind(&task.classification)
        .bind(atomicity_str(task.atomicity))
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.input)?)
        .bind(&output)
        .bind(&error)
        .bind(task.attempt as i64)
        .bind(task.max_attempts as i64)
        .bind(&backoff)
        .bind(task.next_run_at.as_ref().map(format_datetime))
        .bind(task.scheduled_to.as_ref().map(format_datetime))
        .bind(&task.lease_owner)
        .bind(task.lease_expiry.as_ref().map(format_datetime))
        .bind(&steps)
        .bind(task.current_step as i64)
        .bind(&step_results)
        .bind(&log_tail)
        .bind(task.log_tail_max as i64)
        .bind(format_datetime(&task.audit.updated_at))
        .bind(&task.audit.updated_by)
        .bind(task.version as i64)
        .bind(task.id.to_string())
        .bind(prior_version as i64)
        .bind(task.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Conflict(task.id));
        }
        Ok(())
    }

    async fn select(&self, query: Query) -> DomainResult<Vec<Task>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM tasks");
        if let Some(condition) = &query.condition {
            builder.push(" WHERE ");
            push_condition(&mut builder, condition);
        }
        if let Some((field, direction)) = &query.order_by {
            let dir = match direction {
                OrderDirection::Asc => "ASC",
                OrderDirection::Desc => "DESC",
            };
            builder.push(format!(" ORDER BY {field} {dir}"));
        }
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows: Vec<TaskRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_all(&self, ids: &[Uuid]) -> DomainResult<()> {
        for id in ids {
            sqlx::query("DELETE FROM tasks WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn atomicity_str(atomicity: Atomicity) -> &'static str {
    match atomicity {
        Atomicity::Atomic => "atomic",
        Atomicity::Composite => "composite",
    }
}

fn atomicity_from_str(s: &str) -> DomainResult<Atomicity> {
    match s {
        "atomic" => Ok(Atomicity::Atomic),
        "composite" => Ok(Atomicity::Composite),
        other => Err(DomainError::SerializationError(format!("invalid atomicity: {other}"))),
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    classification: String,
    atomicity: String,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    attempt: i64,
    max_attempts: i64,
    backoff: String,
    next_run_at: Option<String>,
    scheduled_to: Option<String>,
    lease_owner: Option<String>,
    lease_expiry: Option<String>,
    steps: String,
    current_step: i64,
    step_results: String,
    log_tail: String,
    log_tail_max: i64,
    created_at: String,
    updated_at: String,
    created_by: Option<String>,
    updated_by: Option<String>,
    version: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> DomainResult<Self> {
        let id = Uuid::parse_str(&row.id).map_err(|e| DomainError::SerializationError(e.to_string()))?;
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("invalid status: {}", row.status)))?;

        Ok(Task {
            id,
            classification: row.classification,
            atomicity: atomicity_from_str(&row.atomicity)?,
            status,
            input: parse_json(&row.input)?,
            output: row.output.as_deref().map(parse_json).transpose()?,
            error: row.error.as_deref().map(parse_json).transpose()?,
            attempt: row.attempt as u32,
            max_attempts: row.max_attempts as u32,
            backoff: parse_json::<Backoff>(&row.backoff)?,
            next_run_at: parse_optional_datetime(row.next_run_at)?,
            scheduled_to: parse_optional_datetime(row.scheduled_to)?,
            lease_owner: row.lease_owner,
            lease_expiry: parse_optional_datetime(row.lease_expiry)?,
            steps: parse_json::<Vec<StepSpec>>(&row.steps)?,
            current_step: row.current_step as usize,
            step_results: parse_json::<Vec<StepResult>>(&row.step_results)?,
            log_tail: parse_json::<Vec<LogEntry>>(&row.log_tail)?,
            log_tail_max: row.log_tail_max as usize,
            audit: AuditFields {
                created_at: parse_datetime(&row.created_at)?,
                updated_at: parse_datetime(&row.updated_at)?,
                created_by: row.created_by,
                updated_by: row.updated_by,
            },
            version: row.version as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::ports::persistence::attr;
    use serde_json::json;

    async fn setup() -> SqliteTaskRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskRepository::new(pool)
    }

    #[tokio::test]
    async fn create_and_read_roundtrip() {
        let repo = setup().await;
        let task = Task::new_atomic("double", json!(21));
        repo.create(&task).await.unwrap();

        let reloaded = repo.read(task.id).await.unwrap();
        assert_eq!(reloaded.classification, "double");
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert_eq!(reloaded.input, json!(21));
    }

    #[tokio::test]
    async fn read_missing_task_is_not_found() {
        let repo = setup().await;
        let err = repo.read(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DomainError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let repo = setup().await;
        let task = Task::new_atomic("double", json!(1));
        repo.create(&task).await.unwrap();

        let mut first = task.clone();
        first.apply_claim("worker-a", 30_000, chrono::Utc::now());
        repo.update(&first).await.unwrap();

        let mut stale = task.clone();
        stale.apply_claim("worker-b", 30_000, chrono::Utc::now());
        let err = repo.update(&stale).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn select_filters_by_status() {
        let repo = setup().await;
        let pending = Task::new_atomic("double", json!(1));
        let mut running = Task::new_atomic("double", json!(2));
        running.apply_claim("worker-a", 30_000, chrono::Utc::now());
        repo.create(&pending).await.unwrap();
        repo.create(&running).await.unwrap();

        let results = repo.select(Query::new().where_(attr("status").eq("pending"))).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, pending.id);
    }
}
