//! Durable record types shared across the engine.

pub mod event;
pub mod task;

pub use event::{Event, EventClassification};
pub use task::{
    Atomicity, AuditFields, Backoff, BackoffStrategy, ErrorRecord, Jitter, LogEntry, LogLevel,
    StepResult, StepSpec, StepStatus, Task, TaskStatus,
};
