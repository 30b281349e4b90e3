//! Argument validation against a tool's declared input schema.
//!
//! Covers the subset of JSON Schema that tool descriptors use in practice:
//!
//! 1. `required` names must be present and non-null.
//! 2. Unknown keys are rejected when `additionalProperties` is `false`.
//! 3. Each value must match its property's `type`.
//! 4. `enum`, `minimum`/`maximum` and `minLength`/`maxLength` where declared.
//!
//! A schema without `properties` accepts any object.

use serde_json::{Map, Value};

/// A single validation violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Offending parameter (empty for top-level problems)
    pub param: String,
    /// What is wrong with it
    pub message: String,
}

impl Violation {
    fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.param.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "'{}': {}", self.param, self.message)
        }
    }
}

/// Validate `arguments` against `schema`.
///
/// `Null` arguments are treated as an empty object.
///
/// # Errors
///
/// Returns every violation found.
pub fn validate_arguments(arguments: &Value, schema: &Value) -> Result<(), Vec<Violation>> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(vec![Violation::new(
                "",
                format!("arguments must be an object, got {}", json_type_name(other)),
            )]);
        }
    };

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    let mut violations = Vec::new();

    for name in schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        match args.get(name) {
            None => violations.push(Violation::new(name, "required parameter is missing")),
            Some(Value::Null) => {
                violations.push(Violation::new(name, "required parameter must not be null"));
            }
            Some(_) => {}
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
    if closed {
        for key in args.keys().filter(|k| !properties.contains_key(k.as_str())) {
            violations.push(Violation::new(key, "unknown parameter"));
        }
    }

    for (name, prop) in properties {
        match args.get(name) {
            None | Some(Value::Null) => {}
            Some(value) => check_property(name, value, prop, &mut violations),
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Join violations into a single client-facing message
#[must_use]
pub fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn check_property(name: &str, value: &Value, prop: &Value, out: &mut Vec<Violation>) {
    if let Some(expected) = prop.get("type").and_then(Value::as_str) {
        if !type_matches(value, expected) {
            out.push(Violation::new(
                name,
                format!("expected {expected}, got {}", json_type_name(value)),
            ));
            return;
        }
    }

    if let Some(options) = prop.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            let listed: Vec<String> = options.iter().map(Value::to_string).collect();
            out.push(Violation::new(
                name,
                format!("must be one of: {}", listed.join(", ")),
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
            if n < min {
                out.push(Violation::new(name, format!("must be >= {min}")));
            }
        }
        if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
            if n > max {
                out.push(Violation::new(name, format!("must be <= {max}")));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = prop.get("minLength").and_then(Value::as_u64) {
            if len < min {
                out.push(Violation::new(
                    name,
                    format!("must be at least {min} characters long"),
                ));
            }
        }
        if let Some(max) = prop.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                out.push(Violation::new(
                    name,
                    format!("must be at most {max} characters long"),
                ));
            }
        }
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
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
