use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::code::SourceCode;
use crate::piece::PiecePackage;

/// The step that starts a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
  pub name: String,
  #[serde(default)]
  pub display_name: String,
  #[serde(flatten)]
  pub kind: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
  /// Placeholder trigger of an unfinished flow. The payload passes through.
  Empty,
  /// Generic webhook trigger. The payload passes through.
  Webhook,
  /// A trigger implemented by a piece.
  Piece(PieceTriggerSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceTriggerSettings {
  pub piece: PiecePackage,
  pub trigger_name: String,
  #[serde(default)]
  pub input: HashMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub auth: Option<serde_json::Value>,
}

/// A step that runs after the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
  pub name: String,
  #[serde(default)]
  pub display_name: String,
  #[serde(flatten)]
  pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
  Code(CodeActionSettings),
  Piece(PieceActionSettings),
  Branch(BranchSettings),
  LoopOnItems(LoopSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeActionSettings {
  pub source_code: SourceCode,
  #[serde(default)]
  pub input: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceActionSettings {
  pub piece: PiecePackage,
  pub action_name: String,
  #[serde(default)]
  pub input: HashMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub auth: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSettings {
  /// Condition groups. The branch succeeds when every condition of at least
  /// one group holds.
  pub conditions: Vec<Vec<BranchCondition>>,
  #[serde(default)]
  pub on_success: Vec<Action>,
  #[serde(default)]
  pub on_failure: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
  pub first_value: String,
  pub operator: BranchOperator,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub second_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchOperator {
  TextEquals,
  TextNotEquals,
  TextContains,
  NumberEquals,
  NumberGreaterThan,
  NumberLessThan,
  BooleanIsTrue,
  BooleanIsFalse,
  Exists,
  DoesNotExist,
}

impl BranchOperator {
  /// Evaluate the operator against already-rendered operands.
  pub fn evaluate(self, first: &serde_json::Value, second: Option<&serde_json::Value>) -> bool {
    let second = second.unwrap_or(&serde_json::Value::Null);
    match self {
      Self::TextEquals => as_text(first) == as_text(second),
      Self::TextNotEquals => as_text(first) != as_text(second),
      Self::TextContains => as_text(first).contains(&as_text(second)),
      Self::NumberEquals => compare_numbers(first, second, |a, b| a == b),
      Self::NumberGreaterThan => compare_numbers(first, second, |a, b| a > b),
      Self::NumberLessThan => compare_numbers(first, second, |a, b| a < b),
      Self::BooleanIsTrue => as_bool(first) == Some(true),
      Self::BooleanIsFalse => as_bool(first) == Some(false),
      Self::Exists => !is_empty(first),
      Self::DoesNotExist => is_empty(first),
    }
  }
}

fn as_text(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    serde_json::Value::Null => String::new(),
    other => other.to_string(),
  }
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
  match value {
    serde_json::Value::Number(n) => n.as_f64(),
    serde_json::Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn as_bool(value: &serde_json::Value) -> Option<bool> {
  match value {
    serde_json::Value::Bool(b) => Some(*b),
    serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
      "true" => Some(true),
      "false" => Some(false),
      _ => None,
    },
    _ => None,
  }
}

fn compare_numbers(
  first: &serde_json::Value,
  second: &serde_json::Value,
  cmp: impl Fn(f64, f64) -> bool,
) -> bool {
  match (as_number(first), as_number(second)) {
    (Some(a), Some(b)) => cmp(a, b),
    _ => false,
  }
}

fn is_empty(value: &serde_json::Value) -> bool {
  match value {
    serde_json::Value::Null => true,
    serde_json::Value::String(s) => s.is_empty(),
    _ => false,
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSettings {
  /// Template that must evaluate to an array.
  pub items: String,
  #[serde(default)]
  pub body: Vec<Action>,
}

impl Action {
  /// Direct child actions (branch arms, loop body).
  pub fn children(&self) -> Vec<&Action> {
    match &self.kind {
      ActionKind::Branch(branch) => branch.on_success.iter().chain(&branch.on_failure).collect(),
      ActionKind::LoopOnItems(settings) => settings.body.iter().collect(),
      ActionKind::Code(_) | ActionKind::Piece(_) => Vec::new(),
    }
  }

  pub(crate) fn children_mut(&mut self) -> Vec<&mut Action> {
    match &mut self.kind {
      ActionKind::Branch(branch) => branch
        .on_success
        .iter_mut()
        .chain(branch.on_failure.iter_mut())
        .collect(),
      ActionKind::LoopOnItems(settings) => settings.body.iter_mut().collect(),
      ActionKind::Code(_) | ActionKind::Piece(_) => Vec::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_text_operators() {
    assert!(BranchOperator::TextEquals.evaluate(&json!("a"), Some(&json!("a"))));
    assert!(BranchOperator::TextNotEquals.evaluate(&json!("a"), Some(&json!("b"))));
    assert!(BranchOperator::TextContains.evaluate(&json!("hello world"), Some(&json!("world"))));
    assert!(BranchOperator::TextEquals.evaluate(&json!(5), Some(&json!("5"))));
  }

  #[test]
  fn test_number_operators() {
    assert!(BranchOperator::NumberGreaterThan.evaluate(&json!(10), Some(&json!("3"))));
    assert!(BranchOperator::NumberLessThan.evaluate(&json!("1.5"), Some(&json!(2))));
    assert!(!BranchOperator::NumberEquals.evaluate(&json!("abc"), Some(&json!(2))));
  }

  #[test]
  fn test_existence_operators() {
    assert!(BranchOperator::Exists.evaluate(&json!("x"), None));
    assert!(BranchOperator::DoesNotExist.evaluate(&json!(null), None));
    assert!(BranchOperator::DoesNotExist.evaluate(&json!(""), None));
    assert!(BranchOperator::BooleanIsTrue.evaluate(&json!("TRUE"), None));
    assert!(BranchOperator::BooleanIsFalse.evaluate(&json!(false), None));
  }

  #[test]
  fn test_action_deserializes_with_inline_type() {
    let action: Action = serde_json::from_value(json!({
      "name": "step_1",
      "type": "CODE",
      "source_code": { "code": "return 1" },
      "input": { "a": "{{ trigger.a }}" }
    }))
    .unwrap();

    match action.kind {
      ActionKind::Code(settings) => {
        assert_eq!(settings.source_code.code, "return 1");
        assert_eq!(settings.input["a"], "{{ trigger.a }}");
      }
      other => panic!("expected code action, got {:?}", other),
    }
  }
}
