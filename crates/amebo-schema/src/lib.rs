#![deny(unsafe_code)]
//! amebo-schema
//!
//! Process-resident mapping from action name to a compiled JSON Schema
//! validator. Never invalidated at runtime — schema mutation requires a
//! process restart, a stated simplification.

use amebo_core::Error;
use dashmap::DashMap;
use jsonschema::Validator;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// A concurrent cache of compiled validators keyed by action name.
///
/// Concurrent first-insert for the same key is tolerated: two callers racing
/// to compile the same action's schema both succeed and one validator simply
/// overwrites the other (`DashMap::insert` semantics) — both are equivalent
/// compilations of the same schema text, so it does not matter which wins.
#[derive(Default, Clone)]
pub struct SchemaCache {
    validators: Arc<DashMap<String, Arc<Validator>>>,
}

impl SchemaCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached validator for `action`, compiling and inserting it
    /// from `schemata` on first use.
    ///
    /// `schemata` is only consulted on a cache miss — once an action's
    /// validator is cached, its schema text is never re-read.
    pub fn get_or_compile(&self, action: &str, schemata: &str) -> Result<Arc<Validator>, Error> {
        if let Some(existing) = self.validators.get(action) {
            return Ok(Arc::clone(&existing));
        }

        let schema_value: Value = serde_json::from_str(schemata).map_err(|err| {
            Error::Unprocessable(format!("action '{action}' has malformed schema JSON: {err}"))
        })?;

        let validator = jsonschema::validator_for(&schema_value).map_err(|err| {
            Error::Unprocessable(format!(
                "action '{action}' schema does not compile: {err}"
            ))
        })?;

        let validator = Arc::new(validator);
        self.validators
            .insert(action.to_string(), Arc::clone(&validator));
        info!(action, "compiled and cached schema validator");
        Ok(validator)
    }

    /// Validates `payload` against `action`'s schema, compiling it first if
    /// necessary. Returns every violation message on failure.
    pub fn validate(
        &self,
        action: &str,
        schemata: &str,
        payload: &Value,
    ) -> Result<(), Error> {
        let validator = self.get_or_compile(action, schemata)?;
        let errors: Vec<String> = validator.iter_errors(payload).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::SchemaViolation(errors))
        }
    }

    /// Number of actions currently cached. Exposed for tests and diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// `true` if no action has been compiled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const USER_CREATED_SCHEMA: &str = r#"{
        "type": "object",
        "required": ["id"],
        "properties": { "id": { "type": "integer" } }
    }"#;

    #[test]
    fn compiles_and_caches_on_first_use() {
        let cache = SchemaCache::new();
        assert!(cache.is_empty());
        cache
            .validate("user.created", USER_CREATED_SCHEMA, &json!({"id": 1}))
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn second_validation_does_not_need_schemata_again() {
        let cache = SchemaCache::new();
        cache
            .validate("user.created", USER_CREATED_SCHEMA, &json!({"id": 1}))
            .unwrap();
        // Bogus schema text is ignored because the validator is already cached.
        cache
            .validate("user.created", "not json at all", &json!({"id": 2}))
            .unwrap();
    }

    #[test]
    fn rejects_payload_that_violates_schema() {
        let cache = SchemaCache::new();
        let err = cache
            .validate("user.created", USER_CREATED_SCHEMA, &json!({"id": "nope"}))
            .unwrap_err();
        match err {
            Error::SchemaViolation(msgs) => assert!(!msgs.is_empty()),
            other => panic!("expected SchemaViolation, got {other:?}"),
        }
    }

    #[test]
    fn malformed_schema_text_is_unprocessable() {
        let cache = SchemaCache::new();
        let err = cache
            .validate("broken.action", "{not json", &json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::Unprocessable(_)));
    }
}
