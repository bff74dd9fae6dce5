use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flow::FlowVersion;
use crate::piece::PiecePackage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineOperationType {
  ExecuteFlow,
  ExecuteTriggerHook,
  ExecuteStep,
  ExecuteProperty,
  ExecuteValidateAuth,
  ExtractPieceMetadata,
}

impl EngineOperationType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::ExecuteFlow => "EXECUTE_FLOW",
      Self::ExecuteTriggerHook => "EXECUTE_TRIGGER_HOOK",
      Self::ExecuteStep => "EXECUTE_STEP",
      Self::ExecuteProperty => "EXECUTE_PROPERTY",
      Self::ExecuteValidateAuth => "EXECUTE_VALIDATE_AUTH",
      Self::ExtractPieceMetadata => "EXTRACT_PIECE_METADATA",
    }
  }
}

impl fmt::Display for EngineOperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerHookType {
  OnEnable,
  OnDisable,
  Run,
  Test,
}

/// One unit of work submitted to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineOperation {
  ExecuteFlow(ExecuteFlowOperation),
  ExecuteTriggerHook(ExecuteTriggerOperation),
  ExecuteStep(ExecuteStepOperation),
  ExecuteProperty(ExecutePropertyOperation),
  ExecuteValidateAuth(ExecuteValidateAuthOperation),
  ExtractPieceMetadata(ExtractPieceMetadataOperation),
}

impl EngineOperation {
  pub fn operation_type(&self) -> EngineOperationType {
    match self {
      Self::ExecuteFlow(_) => EngineOperationType::ExecuteFlow,
      Self::ExecuteTriggerHook(_) => EngineOperationType::ExecuteTriggerHook,
      Self::ExecuteStep(_) => EngineOperationType::ExecuteStep,
      Self::ExecuteProperty(_) => EngineOperationType::ExecuteProperty,
      Self::ExecuteValidateAuth(_) => EngineOperationType::ExecuteValidateAuth,
      Self::ExtractPieceMetadata(_) => EngineOperationType::ExtractPieceMetadata,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteFlowOperation {
  #[serde(default)]
  pub project_id: String,
  pub flow_version: FlowVersion,
  #[serde(default)]
  pub trigger_payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStepOperation {
  #[serde(default)]
  pub project_id: String,
  pub flow_version: FlowVersion,
  pub step_name: String,
  /// Outputs of earlier steps keyed by step name, used as the run context.
  #[serde(default)]
  pub sample_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTriggerOperation {
  #[serde(default)]
  pub project_id: String,
  pub flow_version: FlowVersion,
  pub hook_type: TriggerHookType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trigger_payload: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePropertyOperation {
  #[serde(default)]
  pub project_id: String,
  pub piece: PiecePackage,
  pub action_or_trigger_name: String,
  pub property_name: String,
  /// Templates for the other props of the action, rendered before the call.
  #[serde(default)]
  pub input: HashMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub auth: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteValidateAuthOperation {
  #[serde(default)]
  pub project_id: String,
  pub piece: PiecePackage,
  pub auth: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPieceMetadataOperation {
  pub piece: PiecePackage,
}
