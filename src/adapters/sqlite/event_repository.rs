//! SQLite implementation of `Repository<Event>`. Events are append-only:
//! `update` and `delete_all` are not meaningful operations against the log
//! and are no-ops, matching `adapters::memory::MemoryEventRepository`.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_datetime, parse_json};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Event, EventClassification};
use crate::domain::ports::persistence::{Condition, ConditionValue, Query, Repository};

#[derive(Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
}

impl SqliteEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn classification_str(c: EventClassification) -> &'static str {
    c.as_str()
}

fn classification_from_str(s: &str) -> DomainResult<EventClassification> {
    match s {
        "status" => Ok(EventClassification::Status),
        "log" => Ok(EventClassification::Log),
        "progress" => Ok(EventClassification::Progress),
        other => Err(DomainError::SerializationError(format!("invalid event classification: {other}"))),
    }
}

#[async_trait]
impl Repository<Event> for SqliteEventRepository {
    async fn create(&self, event: &Event) -> DomainResult<()> {
        let payload = serde_json::to_string(&event.payload)?;
        sqlx::query("INSERT INTO events (uuid, task_id, classification, ts, payload) VALUES (?, ?, ?, ?, ?)")
            .bind(event.uuid.to_string())
            .bind(event.task_id.to_string())
            .bind(classification_str(event.classification))
            .bind(event.ts.to_rfc3339())
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read(&self, id: Uuid) -> DomainResult<Event> {
        let row: Option<EventRow> = sqlx::query_as("SELECT * FROM events WHERE uuid = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(DomainError::TaskNotFound(id))?.try_into()
    }

    async fn update(&self, _event: &Event) -> DomainResult<()> {
        Ok(())
    }

    async fn select(&self, query: Query) -> DomainResult<Vec<Event>> {
        let mut sql = String::from("SELECT * FROM events");
        let mut bind: Option<String> = None;

        if let Some(Condition::Eq(field, ConditionValue::Uuid(task_id))) = &query.condition {
            if field == "task_id" {
                sql.push_str(" WHERE task_id = ?");
                bind = Some(task_id.to_string());
            }
        }
        sql.push_str(" ORDER BY ts ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query_as::<_, EventRow>(&sql);
        if let Some(id) = &bind {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_all(&self, _ids: &[Uuid]) -> DomainResult<()> {
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    uuid: String,
    task_id: String,
    classification: String,
    ts: String,
    payload: String,
}

impl TryFrom<EventRow> for Event {
    type Error = DomainError;

    fn try_from(row: EventRow) -> DomainResult<Self> {
        Ok(Event {
            uuid: Uuid::parse_str(&row.uuid).map_err(|e| DomainError::SerializationError(e.to_string()))?,
            task_id: Uuid::parse_str(&row.task_id).map_err(|e| DomainError::SerializationError(e.to_string()))?,
            classification: classification_from_str(&row.classification)?,
            ts: parse_datetime(&row.ts)?,
            payload: parse_json(&row.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::ports::persistence::attr;
    use serde_json::json;

    async fn setup() -> SqliteEventRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteEventRepository::new(pool)
    }

    #[tokio::test]
    async fn create_and_select_by_task() {
        let repo = setup().await;
        let task_id = Uuid::new_v4();
        repo.create(&Event::new(task_id, EventClassification::Status, json!({"status": "running"}))).await.unwrap();
        repo.create(&Event::new(task_id, EventClassification::Log, json!({"msg": "hi"}))).await.unwrap();
        repo.create(&Event::new(Uuid::new_v4(), EventClassification::Status, json!({}))).await.unwrap();

        let events = repo.select(Query::new().where_(attr("task_id").eq(task_id))).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].classification, EventClassification::Status);
    }

    #[tokio::test]
    async fn read_roundtrips_a_single_event() {
        let repo = setup().await;
        let event = Event::new(Uuid::new_v4(), EventClassification::Progress, json!({"pct": 50}));
        repo.create(&event).await.unwrap();

        let reloaded = repo.read(event.uuid).await.unwrap();
        assert_eq!(reloaded.payload, json!({"pct": 50}));
    }
}
