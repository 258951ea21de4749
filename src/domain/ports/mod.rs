//! Ports the engine consumes but does not implement (spec.md §6).

pub mod logger;
pub mod persistence;

pub use logger::{Level, Logger, TracingLogger};
pub use persistence::{attr, Attr, Condition, ConditionValue, OrderDirection, Query, Repository};
