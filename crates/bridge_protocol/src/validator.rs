use std::fmt;

use jsonschema::{Draft, Validator};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::specification::SpecError;

/// Prefix of references into the shared type document.
pub const COMMON_TYPES_REF: &str = "common_types#";

/// One violation found while validating a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorDetail {
    /// JSON pointer into the validated value, empty for the root.
    pub instance_path: String,
    /// JSON pointer into the schema keyword that failed.
    pub schema_path: String,
    pub message: String,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance_path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.instance_path, self.message)
        }
    }
}

/// Shared definitions every endpoint schema may reference.
#[derive(Debug, Clone, Default)]
pub struct CommonTypes {
    definitions: Map<String, Value>,
}

impl CommonTypes {
    /// Accepts either `{ "definitions": {...} }` or a bare definitions map.
    pub fn from_document(doc: &Value) -> Result<Self, SpecError> {
        let defs = match doc {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => match map.get("definitions") {
                Some(Value::Object(defs)) => defs.clone(),
                Some(_) => {
                    return Err(SpecError::Malformed(
                        "common_types.definitions must be an object".into(),
                    ));
                }
                None => map.clone(),
            },
            _ => return Err(SpecError::Malformed("common_types must be an object".into())),
        };
        let mut definitions = Map::new();
        for (name, mut schema) in defs {
            relink_refs(&mut schema);
            definitions.insert(name, schema);
        }
        Ok(Self { definitions })
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.definitions.keys()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.definitions.get(name)
    }

    /// Embed the shared definitions into `schema` so that the compiled
    /// validator is self-contained.
    fn link_into(&self, schema: &mut Value) {
        relink_refs(schema);
        let Value::Object(root) = schema else {
            return;
        };
        if self.definitions.is_empty() {
            return;
        }
        let entry = root
            .entry("definitions")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(local) = entry {
            for (name, def) in &self.definitions {
                // local definitions shadow the shared ones
                local.entry(name.clone()).or_insert_with(|| def.clone());
            }
        }
    }
}

/// Rewrite `common_types#/definitions/X` into the local `#/definitions/X`.
fn relink_refs(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if key == "$ref" {
                    if let Value::String(target) = value {
                        if let Some(rest) = target.strip_prefix(COMMON_TYPES_REF) {
                            *target = format!("#{rest}");
                        }
                    }
                } else {
                    relink_refs(value);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(relink_refs),
        _ => {}
    }
}

/// A compiled schema for one endpoint's params or returns.
pub struct SchemaValidator {
    name: String,
    schema: Value,
    validator: Validator,
}

impl SchemaValidator {
    /// Compile `schema`. Fails when the schema itself is not valid draft 7.
    pub fn compile(
        name: impl Into<String>,
        schema: &Value,
        common: &CommonTypes,
    ) -> Result<Self, SpecError> {
        let name = name.into();
        let mut linked = schema.clone();
        common.link_into(&mut linked);
        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .build(&linked)
            .map_err(|e| SpecError::Schema {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            name,
            schema: linked,
            validator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Every violation of `value`; an empty list means valid.
    pub fn validate(&self, value: &Value) -> Vec<ErrorDetail> {
        self.validator
            .iter_errors(value)
            .map(|err| ErrorDetail {
                instance_path: err.instance_path.to_string(),
                schema_path: err.schema_path.to_string(),
                message: err.to_string(),
            })
            .collect()
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.validator.is_valid(value)
    }
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn common() -> CommonTypes {
        CommonTypes::from_document(&json!({
            "definitions": {
                "MessageType": { "type": "string", "enum": ["OK", "WARNING", "ERROR"] },
                "MessageResult": {
                    "type": "object",
                    "properties": {
                        "type": { "$ref": "common_types#/definitions/MessageType" },
                        "content": {}
                    },
                    "required": ["type"]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn shared_definitions_are_resolved() {
        let v = SchemaValidator::compile(
            "dataflow_run.returns",
            &json!({ "$ref": "common_types#/definitions/MessageResult" }),
            &common(),
        )
        .unwrap();
        assert!(v.validate(&json!({"type": "OK"})).is_empty());

        let errors = v.validate(&json!({"type": "MAYBE"}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].instance_path, "/type");
    }

    #[test]
    fn unions_and_optional_fields() {
        let v = SchemaValidator::compile(
            "x",
            &json!({
                "type": "object",
                "properties": {
                    "id": { "type": ["string", "integer"] },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "note": { "type": "string" }
                },
                "required": ["id"]
            }),
            &CommonTypes::default(),
        )
        .unwrap();
        assert!(v.is_valid(&json!({"id": 4})));
        assert!(v.is_valid(&json!({"id": "n-1", "tags": ["a"]})));
        assert!(!v.is_valid(&json!({"id": true})));
        assert!(!v.is_valid(&json!({"tags": []})));
        assert_eq!(v.validate(&json!({"id": 1, "tags": [1, 2]})).len(), 2);
    }

    #[test]
    fn broken_schema_does_not_compile() {
        let err = SchemaValidator::compile("bad", &json!({"type": 12}), &CommonTypes::default())
            .unwrap_err();
        assert!(matches!(err, SpecError::Schema { name, .. } if name == "bad"));
    }

    #[test]
    fn local_definitions_shadow_shared_ones() {
        let v = SchemaValidator::compile(
            "shadow",
            &json!({
                "definitions": { "MessageType": { "type": "integer" } },
                "$ref": "#/definitions/MessageType"
            }),
            &common(),
        )
        .unwrap();
        assert!(v.is_valid(&json!(3)));
    }
}
