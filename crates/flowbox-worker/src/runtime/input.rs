//! Input resolution using minijinja templates.
//!
//! Step inputs are template strings rendered against the run context, which
//! maps `trigger` and every completed step name to its output:
//! ```json
//! { "email": "{{ fetch_user.email }}", "greeting": "Hello {{ trigger.name | title }}!" }
//! ```
//!
//! A template that is exactly one `{{ expr }}` evaluates to the expression's
//! native value, so `"{{ trigger.items }}"` yields an array rather than its
//! string rendering. Anything else renders to a string.
//!
//! Piece props are then coerced to the type they declare. Values that are
//! already native (not strings) are left alone.

use std::collections::HashMap;

use minijinja::{Environment, Value};

/// Failed to render or coerce a step input.
#[derive(Debug, thiserror::Error)]
#[error("input resolution failed for step '{step_name}': {message}")]
pub struct InputError {
  pub step_name: String,
  pub message: String,
}

impl InputError {
  fn new(step_name: &str, message: String) -> Self {
    Self {
      step_name: step_name.to_string(),
      message,
    }
  }
}

/// Declared prop types used for input coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchemaType {
  String,
  Number,
  Integer,
  Boolean,
  Json,
  Array,
  Object,
}

impl SchemaType {
  /// Map a piece prop type (`NUMBER`, `CHECKBOX`, ...) to its coercion.
  pub fn from_prop_type(prop_type: &str) -> Self {
    match prop_type {
      "NUMBER" => Self::Number,
      "INTEGER" => Self::Integer,
      "CHECKBOX" => Self::Boolean,
      "JSON" => Self::Json,
      "ARRAY" => Self::Array,
      "OBJECT" => Self::Object,
      _ => Self::String, // Text, dropdowns and auth values
    }
  }
}

/// Render every input of a step against the run context.
pub fn render_inputs(
  step_name: &str,
  inputs: &HashMap<String, String>,
  context: &serde_json::Map<String, serde_json::Value>,
) -> Result<serde_json::Map<String, serde_json::Value>, InputError> {
  let env = Environment::new();
  let ctx_value = Value::from_serialize(context);

  let mut resolved = serde_json::Map::new();
  for (key, template) in inputs {
    let value = resolve_template(&env, template, &ctx_value)
      .map_err(|e| InputError::new(step_name, format!("failed to resolve input '{}': {}", key, e)))?;
    resolved.insert(key.clone(), value);
  }

  Ok(resolved)
}

/// Render a single template against the run context.
pub fn render_value(
  step_name: &str,
  template: &str,
  context: &serde_json::Map<String, serde_json::Value>,
) -> Result<serde_json::Value, InputError> {
  let env = Environment::new();
  let ctx_value = Value::from_serialize(context);
  resolve_template(&env, template, &ctx_value).map_err(|e| InputError::new(step_name, e))
}

fn resolve_template(
  env: &Environment,
  template: &str,
  context: &Value,
) -> Result<serde_json::Value, String> {
  if let Some(expr) = single_expression(template) {
    let value = env
      .compile_expression(expr)
      .and_then(|compiled| compiled.eval(context))
      .map_err(|e| e.to_string())?;
    return serde_json::to_value(&value).map_err(|e| e.to_string());
  }

  env
    .render_str(template, context.clone())
    .map(serde_json::Value::String)
    .map_err(|e| e.to_string())
}

/// The expression inside a template of the form `{{ expr }}`, if that is all
/// the template contains.
fn single_expression(template: &str) -> Option<&str> {
  let inner = template
    .trim()
    .strip_prefix("{{")?
    .strip_suffix("}}")?;
  if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
    return None;
  }
  let inner = inner.strip_prefix('-').unwrap_or(inner);
  let inner = inner.strip_suffix('-').unwrap_or(inner);
  let inner = inner.trim();
  (!inner.is_empty()).then_some(inner)
}

/// Coerce rendered inputs to the types declared in `schema`.
pub fn coerce_inputs(
  step_name: &str,
  resolved: serde_json::Map<String, serde_json::Value>,
  schema: &HashMap<String, SchemaType>,
) -> Result<serde_json::Value, InputError> {
  let mut result = serde_json::Map::new();

  for (key, value) in resolved {
    let schema_type = schema.get(&key).copied().unwrap_or(SchemaType::String);
    let typed_value = match value {
      serde_json::Value::String(s) => coerce_value(step_name, &key, &s, schema_type)?,
      other => other,
    };
    result.insert(key, typed_value);
  }

  Ok(serde_json::Value::Object(result))
}

/// Coerce a single string value to a typed JSON value.
fn coerce_value(
  step_name: &str,
  input_key: &str,
  value: &str,
  schema_type: SchemaType,
) -> Result<serde_json::Value, InputError> {
  let expected = |what: &str| {
    InputError::new(
      step_name,
      format!("input '{}' expected {}, got '{}'", input_key, what, value),
    )
  };

  // Optional props left blank stay empty.
  if value.is_empty() && schema_type != SchemaType::String {
    return Ok(serde_json::Value::Null);
  }

  match schema_type {
    SchemaType::String => Ok(serde_json::Value::String(value.to_string())),

    SchemaType::Number => {
      let trimmed = value.trim();
      if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(serde_json::Value::Number(n.into()));
      }
      trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
        .ok_or_else(|| expected("number"))
    }

    SchemaType::Integer => value
      .trim()
      .parse::<i64>()
      .map(|n| serde_json::Value::Number(n.into()))
      .map_err(|_| expected("integer")),

    SchemaType::Boolean => match value.trim().to_lowercase().as_str() {
      "true" => Ok(serde_json::Value::Bool(true)),
      "false" => Ok(serde_json::Value::Bool(false)),
      _ => Err(expected("boolean")),
    },

    SchemaType::Json => Ok(
      serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
    ),

    SchemaType::Array => match serde_json::from_str(value) {
      Ok(serde_json::Value::Array(items)) => Ok(serde_json::Value::Array(items)),
      _ => Err(expected("array")),
    },

    SchemaType::Object => match serde_json::from_str(value) {
      Ok(serde_json::Value::Object(map)) => Ok(serde_json::Value::Object(map)),
      _ => Err(expected("object")),
    },
  }
}
