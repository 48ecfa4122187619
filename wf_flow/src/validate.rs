//! ABOUTME: Trigger-time input validation against a flow's declared inputs
//! ABOUTME: Fills defaults, checks types and enum membership, runs expressions

use crate::expr::{eval_bool, Scope};
use crate::model::{Flow, InputKind, InputSpec};
use serde_json::Value;
use wf_core::{Error, Result};

/// Validate a trigger's input object against the flow's declared inputs and
/// return the effective map with defaults filled in. Any failure is terminal
/// for the execution.
pub fn validate_input(flow: &Flow, input: &Value) -> Result<Value> {
    let supplied = match input {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(Error::Validation(format!(
                "Flow input must be an object, got {}",
                other
            )))
        }
    };

    for key in supplied.keys() {
        if flow.input(key).is_none() {
            return Err(Error::Validation(format!(
                "Unknown input '{}' for flow '{}'",
                key,
                flow.slug()
            )));
        }
    }

    let mut effective = serde_json::Map::new();
    for spec in &flow.inputs {
        let value = match supplied.get(&spec.name) {
            Some(v) => v.clone(),
            None => match &spec.default {
                Some(d) => d.clone(),
                None if spec.required => {
                    return Err(Error::Validation(format!(
                        "Missing required input '{}'",
                        spec.name
                    )))
                }
                None => continue,
            },
        };

        check_kind(spec, &value)?;

        if let Some(expression) = &spec.validation {
            let scope = Scope::new(serde_json::json!({
                "value": value,
                "inputs": Value::Object(supplied.clone()),
            }));
            let ok = eval_bool(expression, &scope).map_err(|e| {
                Error::Validation(format!(
                    "Validation expression for input '{}' failed: {}",
                    spec.name, e
                ))
            })?;
            if !ok {
                return Err(Error::Validation(format!(
                    "Input '{}' failed validation '{}'",
                    spec.name, expression
                )));
            }
        }

        effective.insert(spec.name.clone(), value);
    }

    Ok(Value::Object(effective))
}

fn check_kind(spec: &InputSpec, value: &Value) -> Result<()> {
    let ok = match spec.kind {
        InputKind::String | InputKind::Password | InputKind::File | InputKind::Datetime => {
            value.is_string()
        }
        InputKind::Number => value.is_number(),
        InputKind::Checkbox => value.is_boolean(),
        InputKind::Select => match value.as_str() {
            Some(s) => spec.options.iter().any(|o| o == s),
            None => false,
        },
    };
    if !ok {
        return Err(Error::Validation(format!(
            "Input '{}' is not a valid {:?}",
            spec.name, spec.kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Flow;
    use serde_json::json;

    fn flow() -> Flow {
        Flow::parse_yaml(
            br#"
metadata: { id: release, name: Release }
inputs:
  - name: tag
    type: string
    required: true
  - name: replicas
    type: number
    default: 2
    validation: "value > 0 && value <= 10"
  - name: env
    type: select
    options: [staging, prod]
    default: staging
  - name: force
    type: checkbox
    default: false
actions:
  - { id: ship, executor: script }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_filled() {
        let effective = validate_input(&flow(), &json!({"tag": "v1"})).unwrap();
        assert_eq!(effective["tag"], "v1");
        assert_eq!(effective["replicas"], 2);
        assert_eq!(effective["env"], "staging");
        assert_eq!(effective["force"], false);
    }

    #[test]
    fn test_missing_required_rejected() {
        let err = validate_input(&flow(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("tag"));
    }

    #[test]
    fn test_unknown_input_rejected() {
        let err = validate_input(&flow(), &json!({"tag": "v1", "zzz": 1})).unwrap_err();
        assert!(err.to_string().contains("Unknown input"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        assert!(validate_input(&flow(), &json!({"tag": 5})).is_err());
        assert!(validate_input(&flow(), &json!({"tag": "v1", "replicas": "two"})).is_err());
        assert!(validate_input(&flow(), &json!({"tag": "v1", "force": "yes"})).is_err());
    }

    #[test]
    fn test_select_membership() {
        assert!(validate_input(&flow(), &json!({"tag": "v1", "env": "prod"})).is_ok());
        assert!(validate_input(&flow(), &json!({"tag": "v1", "env": "qa"})).is_err());
    }

    #[test]
    fn test_validation_expression_enforced() {
        assert!(validate_input(&flow(), &json!({"tag": "v1", "replicas": 5})).is_ok());
        let err = validate_input(&flow(), &json!({"tag": "v1", "replicas": 50})).unwrap_err();
        assert!(err.to_string().contains("failed validation"));
    }

    #[test]
    fn test_null_input_uses_defaults_only() {
        // tag is required and has no default
        assert!(validate_input(&flow(), &Value::Null).is_err());
    }
}
