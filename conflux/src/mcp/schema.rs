//! JSON-schema validation of tool-call arguments.
//!
//! Compiled validators are memoized per schema so repeated calls against
//! the same tool reuse the compiled form.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};

/// Memoizing JSON-schema validator.
#[derive(Default)]
pub struct SchemaValidator {
    compiled: Mutex<HashMap<u64, Arc<jsonschema::Validator>>>,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("compiled", &self.compiled.lock().len())
            .finish()
    }
}

impl SchemaValidator {
    /// Create an empty validator cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `args` against `schema`, compiling and memoizing the schema
    /// on first sight. Any failure is a non-retryable validation error.
    pub fn validate(&self, tool: &str, schema: &Value, args: &Value) -> Result<()> {
        let validator = self.compiled_for(tool, schema)?;
        if let Err(violation) = validator.validate(args) {
            return Err(Error::validation(tool, violation.to_string()));
        }
        Ok(())
    }

    fn compiled_for(&self, tool: &str, schema: &Value) -> Result<Arc<jsonschema::Validator>> {
        let key = schema_fingerprint(schema);
        if let Some(validator) = self.compiled.lock().get(&key) {
            return Ok(Arc::clone(validator));
        }

        let validator = jsonschema::validator_for(schema)
            .map_err(|e| Error::validation(tool, format!("unusable schema: {e}")))?;
        let validator = Arc::new(validator);
        self.compiled.lock().insert(key, Arc::clone(&validator));
        Ok(validator)
    }

    /// Number of memoized schemas.
    #[must_use]
    pub fn compiled_count(&self) -> usize {
        self.compiled.lock().len()
    }
}

fn schema_fingerprint(schema: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    schema.to_string().hash(&mut hasher);
    hasher.finish()
}
