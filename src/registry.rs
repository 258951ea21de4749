//! Handler Registry (spec.md §4.1).
//!
//! A mapping from `classification` to a handler instance, populated by an
//! explicit bootstrap step rather than decorator/reflection-based discovery
//! (REDESIGN FLAGS §9): `Registry::register(classification, handler)` and
//! `Registry::get(classification)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::TaskContext;
use crate::domain::errors::{DomainError, DomainResult, HandlerOutcome};

/// `run(input, ctx) -> output` for a given classification.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, input: Value, ctx: &TaskContext) -> Result<Value, HandlerOutcome>;
}

/// Maps a classification string to a registered [`Handler`].
///
/// Registration is eager and fails loudly on duplicates; there is no dynamic
/// resolution beyond a single lookup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `classification`. Fails if the classification
    /// is already registered.
    pub fn register(
        &mut self,
        classification: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> DomainResult<()> {
        let classification = classification.into();
        if self.handlers.contains_key(&classification) {
            return Err(DomainError::DuplicateHandler(classification));
        }
        self.handlers.insert(classification, handler);
        Ok(())
    }

    pub fn get(&self, classification: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(classification).cloned()
    }

    /// Look up a handler, surfacing `MissingHandler` immediately rather than
    /// a bare `None` — mirrors spec.md §7's `MissingHandler` treatment as an
    /// ordinary handler error for retry purposes.
    pub fn require(&self, classification: &str) -> DomainResult<Arc<dyn Handler>> {
        self.get(classification)
            .ok_or_else(|| DomainError::MissingHandler(classification.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;

    struct Double;

    #[async_trait]
    impl Handler for Double {
        async fn run(&self, input: Value, _ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
            let n = input.as_i64().unwrap_or(0);
            Ok(Value::from(n * 2))
        }
    }

    #[test]
    fn register_and_get_roundtrip() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", Arc::new(Double)).unwrap();
        assert!(registry.get("double").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", Arc::new(Double)).unwrap();
        let err = registry.register("double", Arc::new(Double)).unwrap_err();
        assert!(matches!(err, DomainError::DuplicateHandler(_)));
    }

    #[test]
    fn require_surfaces_missing_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.require("nope").unwrap_err();
        assert!(matches!(err, DomainError::MissingHandler(_)));
    }
}
