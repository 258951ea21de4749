//! Persistence contract (spec.md §6.1).
//!
//! One [`Repository`] instance per model type. The engine never talks to a
//! database directly — every read, write, and query goes through this port,
//! mirroring `domain::ports::TaskRepository` but generalized to the
//! abstract `create/read/update/select/delete_all` surface this crate
//! requires, plus a small condition builder so the scheduler's claim queries
//! stay backend-agnostic.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;

/// A condition over a single attribute, composable with `and`/`or`/`not`.
///
/// This is a tiny AST, not a query-builder DSL: adapters pattern-match on it
/// to build their native query (SQL `WHERE`, an in-memory predicate, ...).
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(String, ConditionValue),
    Gt(String, ConditionValue),
    Lt(String, ConditionValue),
    Gte(String, ConditionValue),
    Lte(String, ConditionValue),
    In(String, Vec<ConditionValue>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

/// Value comparable within a [`Condition`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    Str(String),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Uuid(Uuid),
}

/// Fluent entry point: `attr("status").eq(...)`.
pub struct Attr(pub String);

pub fn attr(name: impl Into<String>) -> Attr {
    Attr(name.into())
}

impl Attr {
    pub fn eq(self, value: impl Into<ConditionValue>) -> Condition {
        Condition::Eq(self.0, value.into())
    }
    pub fn gt(self, value: impl Into<ConditionValue>) -> Condition {
        Condition::Gt(self.0, value.into())
    }
    pub fn lt(self, value: impl Into<ConditionValue>) -> Condition {
        Condition::Lt(self.0, value.into())
    }
    pub fn gte(self, value: impl Into<ConditionValue>) -> Condition {
        Condition::Gte(self.0, value.into())
    }
    pub fn lte(self, value: impl Into<ConditionValue>) -> Condition {
        Condition::Lte(self.0, value.into())
    }
    pub fn in_(self, values: Vec<ConditionValue>) -> Condition {
        Condition::In(self.0, values)
    }
    /// `attr(name).between(lo, hi)`, lowered to `gte(lo) AND lte(hi)` so
    /// adapters need no dedicated variant to support it.
    pub fn between(self, lo: impl Into<ConditionValue>, hi: impl Into<ConditionValue>) -> Condition {
        Condition::And(
            Box::new(Condition::Gte(self.0.clone(), lo.into())),
            Box::new(Condition::Lte(self.0, hi.into())),
        )
    }
}

impl Condition {
    pub fn and(self, other: Condition) -> Condition {
        Condition::And(Box::new(self), Box::new(other))
    }
    pub fn or(self, other: Condition) -> Condition {
        Condition::Or(Box::new(self), Box::new(other))
    }
    pub fn not(self) -> Condition {
        Condition::Not(Box::new(self))
    }
}

impl From<&str> for ConditionValue {
    fn from(v: &str) -> Self {
        ConditionValue::Str(v.to_string())
    }
}
impl From<String> for ConditionValue {
    fn from(v: String) -> Self {
        ConditionValue::Str(v)
    }
}
impl From<chrono::DateTime<chrono::Utc>> for ConditionValue {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        ConditionValue::Timestamp(v)
    }
}
impl From<Uuid> for ConditionValue {
    fn from(v: Uuid) -> Self {
        ConditionValue::Uuid(v)
    }
}

/// Ordering direction for `order_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// A `select().where(cond).order_by(...).limit(n)` query, built up and then
/// handed to [`Repository::select`].
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub condition: Option<Condition>,
    pub order_by: Option<(String, OrderDirection)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// Generic persistence port: `create`, `read`, `update`, `select().execute()`,
/// `delete_all` (spec.md §6.1). `update` is the compare-and-set boundary: an
/// implementation must surface [`crate::domain::errors::DomainError::Conflict`]
/// when the stored version does not match, so `try_claim` can drop the
/// candidate silently.
#[async_trait]
pub trait Repository<T>: Send + Sync {
    async fn create(&self, model: &T) -> DomainResult<()>;
    async fn read(&self, id: Uuid) -> DomainResult<T>;
    /// Compare-and-set update. Fails with `Conflict` if `model`'s version no
    /// longer matches the persisted version.
    async fn update(&self, model: &T) -> DomainResult<()>;
    async fn select(&self, query: Query) -> DomainResult<Vec<T>>;
    async fn delete_all(&self, ids: &[Uuid]) -> DomainResult<()>;
}

pub type TaskRepository = dyn Repository<crate::domain::models::Task>;
pub type EventRepository = dyn Repository<crate::domain::models::Event>;
