//! Responses produced by the engine runtime, one per operation kind.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
  Succeeded,
  Failed,
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
  pub step_name: String,
  pub status: StepStatus,
  /// Input after template resolution.
  pub input: serde_json::Value,
  #[serde(default)]
  pub output: Option<serde_json::Value>,
  #[serde(default)]
  pub error_message: Option<String>,
  pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRunStatus {
  Succeeded,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStep {
  pub step_name: String,
  pub message: String,
}

/// Result of running a whole flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunResponse {
  pub status: FlowRunStatus,
  /// Every step run, in execution order. Loop bodies appear once per item.
  pub steps: Vec<StepOutput>,
  #[serde(default)]
  pub failed_step: Option<FailedStep>,
  pub duration_ms: u64,
}

impl FlowRunResponse {
  /// The last output recorded for `step_name`.
  pub fn step(&self, step_name: &str) -> Option<&StepOutput> {
    self.steps.iter().rev().find(|s| s.step_name == step_name)
  }
}

/// Result of a trigger hook (`ON_ENABLE`, `ON_DISABLE`, `RUN`, `TEST`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerHookResult {
  pub success: bool,
  /// Items produced by `RUN` / `TEST`. Empty for enable and disable.
  #[serde(default)]
  pub output: Vec<serde_json::Value>,
  #[serde(default)]
  pub message: Option<String>,
}

/// Result of a dynamic property lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyResult {
  pub success: bool,
  #[serde(default)]
  pub options: serde_json::Value,
  #[serde(default)]
  pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateAuthResult {
  pub valid: bool,
  #[serde(default)]
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
  pub name: String,
  pub display_name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub props: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetadata {
  pub name: String,
  pub display_name: String,
  #[serde(default)]
  pub description: String,
  #[serde(rename = "type")]
  pub trigger_type: String,
  #[serde(default)]
  pub sample_data: Option<serde_json::Value>,
  #[serde(default)]
  pub props: BTreeMap<String, serde_json::Value>,
}

/// Everything a piece declares, without its functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceMetadata {
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub display_name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub minimum_supported_release: Option<String>,
  #[serde(default)]
  pub maximum_supported_release: Option<String>,
  #[serde(default)]
  pub auth: Option<serde_json::Value>,
  #[serde(default)]
  pub actions: BTreeMap<String, ActionMetadata>,
  #[serde(default)]
  pub triggers: BTreeMap<String, TriggerMetadata>,
}
