//! In-memory persistence adapter.
//!
//! Grounded on the pattern of pairing each port with a narrow, test-friendly
//! adapter alongside the production one (e.g.
//! `domain::ports::null_memory`/`null_embedding`). Used by this crate's own
//! test suite and available to downstream users who do not need durability.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Event, Task};
use crate::domain::ports::persistence::{Condition, ConditionValue, Query, Repository};

fn matches(condition: &Condition, task: &Task) -> bool {
    match condition {
        Condition::Eq(field, value) => field_eq(field, value, task),
        Condition::Lte(field, value) => field_lte(field, value, task),
        Condition::Gt(field, value) => !field_lte(field, value, task),
        Condition::Lt(field, value) => field_lt(field, value, task),
        Condition::Gte(field, value) => !field_lt(field, value, task),
        Condition::In(field, values) => values.iter().any(|v| field_eq(field, v, task)),
        Condition::And(a, b) => matches(a, task) && matches(b, task),
        Condition::Or(a, b) => matches(a, task) || matches(b, task),
        Condition::Not(inner) => !matches(inner, task),
    }
}

fn field_eq(field: &str, value: &ConditionValue, task: &Task) -> bool {
    match (field, value) {
        ("status", ConditionValue::Str(s)) => task.status.as_str() == s,
        ("id", ConditionValue::Uuid(id)) => task.id == *id,
        _ => false,
    }
}

fn field_lte(field: &str, value: &ConditionValue, task: &Task) -> bool {
    match (field, value) {
        ("scheduled_to", ConditionValue::Timestamp(ts)) => task.scheduled_to.is_some_and(|v| v <= *ts),
        ("next_run_at", ConditionValue::Timestamp(ts)) => task.next_run_at.is_some_and(|v| v <= *ts),
        ("lease_expiry", ConditionValue::Timestamp(ts)) => task.lease_expiry.is_some_and(|v| v <= *ts),
        _ => false,
    }
}

fn field_lt(field: &str, value: &ConditionValue, task: &Task) -> bool {
    match (field, value) {
        ("scheduled_to", ConditionValue::Timestamp(ts)) => task.scheduled_to.is_some_and(|v| v < *ts),
        ("next_run_at", ConditionValue::Timestamp(ts)) => task.next_run_at.is_some_and(|v| v < *ts),
        ("lease_expiry", ConditionValue::Timestamp(ts)) => task.lease_expiry.is_some_and(|v| v < *ts),
        _ => false,
    }
}

/// In-memory `Task` repository with version-based compare-and-set updates.
#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/debug helper: force a task's stored state without CAS checks.
    pub fn force_insert(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id, task);
    }
}

#[async_trait]
impl Repository<Task> for MemoryTaskRepository {
    async fn create(&self, model: &Task) -> DomainResult<()> {
        self.tasks.lock().unwrap().insert(model.id, model.clone());
        Ok(())
    }

    async fn read(&self, id: Uuid) -> DomainResult<Task> {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(DomainError::TaskNotFound(id))
    }

    async fn update(&self, model: &Task) -> DomainResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get(&model.id) {
            None => Err(DomainError::TaskNotFound(model.id)),
            Some(current) if current.version != model.version - 1 && current.version != model.version => {
                Err(DomainError::Conflict(model.id))
            }
            Some(_) => {
                tasks.insert(model.id, model.clone());
                Ok(())
            }
        }
    }

    async fn select(&self, query: Query) -> DomainResult<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| query.condition.as_ref().is_none_or(|c| matches(c, t)))
            .cloned()
            .collect();
        result.sort_by_key(|t| t.id);
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn delete_all(&self, ids: &[Uuid]) -> DomainResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        for id in ids {
            tasks.remove(id);
        }
        Ok(())
    }
}


/// In-memory `Event` repository (append-only; `update`/`delete_all` are not
/// meaningful for an append log and return `Ok` as no-ops to satisfy the
/// port without pretending events are mutable).
#[derive(Default)]
pub struct MemoryEventRepository {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn for_task(&self, task_id: Uuid) -> Vec<Event> {
        self.events.lock().unwrap().iter().filter(|e| e.task_id == task_id).cloned().collect()
    }
}

#[async_trait]
impl Repository<Event> for MemoryEventRepository {
    async fn create(&self, model: &Event) -> DomainResult<()> {
        self.events.lock().unwrap().push(model.clone());
        Ok(())
    }

    async fn read(&self, id: Uuid) -> DomainResult<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.uuid == id)
            .cloned()
            .ok_or(DomainError::TaskNotFound(id))
    }

    async fn update(&self, _model: &Event) -> DomainResult<()> {
        Ok(())
    }

    async fn select(&self, query: Query) -> DomainResult<Vec<Event>> {
        let events = self.events.lock().unwrap();
        let mut result: Vec<Event> = events
            .iter()
            .filter(|e| match &query.condition {
                Some(Condition::Eq(field, ConditionValue::Uuid(id))) if field == "task_id" => e.task_id == *id,
                _ => true,
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn delete_all(&self, _ids: &[Uuid]) -> DomainResult<()> {
        Ok(())
    }
}
