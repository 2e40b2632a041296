//! 参数校验与计划提交格式的 JSON Schema
//!
//! validate_parameters 只检查 capability_schema 中的 required 键与顶层属性的 JSON 类型，
//! 不做完整的 JSON Schema 求值。

use schemars::schema_for;
use serde_json::Value;

use crate::plan::TaskSubmission;

/// 按 capability_schema 校验参数；失败返回可读的原因
pub fn validate_parameters(schema: &Value, params: &Value) -> Result<(), String> {
    let obj = match params {
        Value::Object(map) => map,
        Value::Null => {
            return match required_keys(schema).first() {
                Some(key) => Err(format!("missing required parameter '{key}'")),
                None => Ok(()),
            };
        }
        other => {
            return Err(format!(
                "parameters must be a JSON object, got {}",
                json_type_name(other)
            ))
        }
    };

    for key in required_keys(schema) {
        if !obj.contains_key(key) {
            return Err(format!("missing required parameter '{key}'"));
        }
    }

    if let Some(Value::Object(properties)) = schema.get("properties") {
        for (key, value) in obj {
            let expected = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !type_matches(expected, value) {
                    return Err(format!(
                        "parameter '{key}' should be {expected}, got {}",
                        json_type_name(value)
                    ));
                }
            }
        }
    }

    Ok(())
}

fn required_keys(schema: &Value) -> Vec<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 返回计划提交格式的 JSON Schema，供上游规划器生成合法计划
pub fn submission_schema_json() -> String {
    let schema = schema_for!(TaskSubmission);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
