//! Argument validation against a tool's JSON Schema.
//!
//! Schemas are compiled once per tool name and reused until the tool's
//! definition changes.

use jsonschema::Validator;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::tool::ToolDefinition;

struct Compiled {
    schema: Value,
    validator: Option<Arc<Validator>>,
}

/// Compiled validators keyed by tool name.
#[derive(Default)]
pub struct SchemaValidators {
    compiled: Mutex<HashMap<String, Compiled>>,
}

impl SchemaValidators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize and validate `args` for `def`. `null` becomes `{}`.
    pub fn validate(&self, def: &ToolDefinition, args: Value) -> Result<Value, String> {
        let args = normalize(args)?;
        match self.validator_for(def) {
            Some(validator) => check(&validator, &args).map(|()| args),
            None => Ok(args),
        }
    }

    pub fn len(&self) -> usize {
        self.compiled.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` when the tool's own schema does not compile; such tools are
    /// only held to the object check.
    fn validator_for(&self, def: &ToolDefinition) -> Option<Arc<Validator>> {
        let Ok(mut compiled) = self.compiled.lock() else {
            return compile(&def.name, &def.input_schema);
        };
        if let Some(entry) = compiled.get(&def.name) {
            if entry.schema == def.input_schema {
                return entry.validator.clone();
            }
        }
        let validator = compile(&def.name, &def.input_schema);
        compiled.insert(
            def.name.clone(),
            Compiled {
                schema: def.input_schema.clone(),
                validator: validator.clone(),
            },
        );
        validator
    }
}

fn normalize(args: Value) -> Result<Value, String> {
    match args {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(map) => Ok(Value::Object(map)),
        other => Err(format!("arguments must be a JSON object, got {}", type_name(&other))),
    }
}

fn compile(tool: &str, schema: &Value) -> Option<Arc<Validator>> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => Some(Arc::new(validator)),
        Err(e) => {
            warn!(tool, error = %e, "Tool schema does not compile; skipping validation");
            None
        }
    }
}

fn check(validator: &Validator, args: &Value) -> Result<(), String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path().to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
