use crate::error::{LifecycleError, Result};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    /// JSON integers, or strings holding one.
    Integer,
    Boolean,
    Enum(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub description: &'static str,
}

impl ArgSpec {
    pub const fn required(name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }

    fn check(&self, value: &Value) -> Result<Value> {
        let wrong = |expected: &str| {
            LifecycleError::validation(self.name, format!("expected {}, got {}", expected, value))
        };
        match self.kind {
            ArgKind::String => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(wrong("a string")),
            },
            ArgKind::Integer => match value {
                Value::Number(n) if n.is_i64() => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(|n| json!(n))
                    .map_err(|_| wrong("an integer")),
                _ => Err(wrong("an integer")),
            },
            ArgKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                _ => Err(wrong("a boolean")),
            },
            ArgKind::Enum(choices) => match value.as_str() {
                Some(s) if choices.contains(&s) => Ok(value.clone()),
                _ => Err(LifecycleError::validation(
                    self.name,
                    format!("must be one of: {}", choices.join(", ")),
                )),
            },
        }
    }

    fn schema(&self) -> Value {
        let mut prop = match self.kind {
            ArgKind::String => json!({ "type": "string" }),
            ArgKind::Integer => json!({ "type": "integer" }),
            ArgKind::Boolean => json!({ "type": "boolean" }),
            ArgKind::Enum(choices) => json!({ "type": "string", "enum": choices }),
        };
        prop["description"] = json!(self.description);
        prop
    }
}

/// Check `args` against `specs` and return the known arguments, normalized.
///
/// Unknown keys are dropped. `null` counts as absent.
pub fn validate(specs: &[ArgSpec], args: &Value) -> Result<Map<String, Value>> {
    let empty = Map::new();
    let given = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(LifecycleError::validation(
                "arguments",
                format!("expected an object, got {}", other),
            ))
        }
    };

    let mut out = Map::new();
    for spec in specs {
        match given.get(spec.name).filter(|v| !v.is_null()) {
            Some(v) => {
                out.insert(spec.name.to_string(), spec.check(v)?);
            }
            None if spec.required => {
                return Err(LifecycleError::validation(spec.name, "missing required argument"));
            }
            None => {}
        }
    }
    Ok(out)
}

pub fn input_schema(specs: &[ArgSpec]) -> Value {
    let properties: Map<String, Value> = specs
        .iter()
        .map(|s| (s.name.to_string(), s.schema()))
        .collect();
    let required: Vec<&str> = specs.iter().filter(|s| s.required).map(|s| s.name).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECS: &[ArgSpec] = &[
        ArgSpec::required("node", ArgKind::String, "Node name"),
        ArgSpec::required("vmid", ArgKind::Integer, "Guest id"),
        ArgSpec::optional("force", ArgKind::Boolean, "Stop first"),
        ArgSpec::optional("mode", ArgKind::Enum(&["fast", "slow"]), "Mode"),
    ];

    #[test]
    fn test_validate_normalizes_numeric_strings() {
        let out = validate(SPECS, &json!({ "node": "pve1", "vmid": "101", "extra": 1 })).unwrap();
        assert_eq!(out["vmid"], json!(101));
        assert!(!out.contains_key("extra"));
    }

    #[test]
    fn test_validate_reports_field() {
        let err = validate(SPECS, &json!({ "node": "pve1" })).unwrap_err();
        assert_eq!(err.field(), Some("vmid"));

        let err = validate(SPECS, &json!({ "node": "pve1", "vmid": "abc" })).unwrap_err();
        assert_eq!(err.field(), Some("vmid"));

        let err = validate(SPECS, &json!({ "node": 3, "vmid": 1 })).unwrap_err();
        assert_eq!(err.field(), Some("node"));

        let err = validate(SPECS, &json!({ "node": "a", "vmid": 1, "mode": "warp" })).unwrap_err();
        assert_eq!(err.field(), Some("mode"));
        assert!(err.to_string().contains("fast, slow"));
    }

    #[test]
    fn test_input_schema() {
        let schema = input_schema(SPECS);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["vmid"]["type"], "integer");
        assert_eq!(schema["properties"]["mode"]["enum"], json!(["fast", "slow"]));
        assert_eq!(schema["required"], json!(["node", "vmid"]));
    }
}
