//! Persistence adapters implementing `domain::ports::persistence::Repository`.

pub mod memory;
pub mod sqlite;
