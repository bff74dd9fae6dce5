use serde::{Deserialize, Serialize};

use crate::code::CodeArtifact;
use crate::piece::PiecePackage;
use crate::step::{Action, ActionKind, Trigger, TriggerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowVersionState {
  /// Still being edited. Compiled artifacts are never reused.
  Draft,
  /// Immutable snapshot. Step definitions and pinned versions never change.
  Locked,
}

/// One version of a flow: a trigger followed by an ordered list of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVersion {
  pub id: String,
  pub flow_id: String,
  #[serde(default)]
  pub display_name: String,
  pub state: FlowVersionState,
  pub trigger: Trigger,
  #[serde(default)]
  pub actions: Vec<Action>,
}

/// A step found by name.
#[derive(Debug, Clone, Copy)]
pub enum StepRef<'a> {
  Trigger(&'a Trigger),
  Action(&'a Action),
}

impl<'a> StepRef<'a> {
  pub fn name(&self) -> &'a str {
    match *self {
      StepRef::Trigger(trigger) => &trigger.name,
      StepRef::Action(action) => &action.name,
    }
  }

  /// The piece this step runs, if any.
  pub fn piece(&self) -> Option<&'a PiecePackage> {
    match *self {
      StepRef::Trigger(trigger) => match &trigger.kind {
        TriggerKind::Piece(settings) => Some(&settings.piece),
        TriggerKind::Empty | TriggerKind::Webhook => None,
      },
      StepRef::Action(action) => match &action.kind {
        ActionKind::Piece(settings) => Some(&settings.piece),
        _ => None,
      },
    }
  }
}

pub(crate) enum StepMut<'a> {
  Trigger(&'a mut Trigger),
  Action(&'a mut Action),
}

impl FlowVersion {
  pub fn is_locked(&self) -> bool {
    self.state == FlowVersionState::Locked
  }

  /// Finds a step by name, searching the trigger and every nested action.
  pub fn get_step(&self, name: &str) -> Option<StepRef<'_>> {
    if self.trigger.name == name {
      return Some(StepRef::Trigger(&self.trigger));
    }
    self
      .all_actions()
      .into_iter()
      .find(|action| action.name == name)
      .map(StepRef::Action)
  }

  /// Every action in the flow, depth first in declaration order.
  pub fn all_actions(&self) -> Vec<&Action> {
    let mut out = Vec::new();
    let mut stack: Vec<&Action> = self.actions.iter().rev().collect();
    while let Some(action) = stack.pop() {
      out.push(action);
      stack.extend(action.children().into_iter().rev());
    }
    out
  }

  /// Code artifacts for every code step, keyed to this flow version.
  pub fn code_artifacts(&self) -> Vec<CodeArtifact> {
    self
      .all_actions()
      .into_iter()
      .filter_map(|action| self.code_artifact_for(action))
      .collect()
  }

  /// The code artifact of a single action, when it is a code step.
  pub fn code_artifact_for(&self, action: &Action) -> Option<CodeArtifact> {
    match &action.kind {
      ActionKind::Code(settings) => Some(CodeArtifact {
        name: action.name.clone(),
        flow_version_id: self.id.clone(),
        flow_version_state: self.state,
        source_code: settings.source_code.clone(),
      }),
      _ => None,
    }
  }

  /// Piece references of every step, duplicates included.
  pub fn piece_packages(&self) -> Vec<&PiecePackage> {
    let mut pieces = Vec::new();
    if let Some(piece) = StepRef::Trigger(&self.trigger).piece() {
      pieces.push(piece);
    }
    for action in self.all_actions() {
      if let Some(piece) = StepRef::Action(action).piece() {
        pieces.push(piece);
      }
    }
    pieces
  }

  pub(crate) fn get_step_mut(&mut self, name: &str) -> Option<StepMut<'_>> {
    if self.trigger.name == name {
      return Some(StepMut::Trigger(&mut self.trigger));
    }
    let mut stack: Vec<&mut Action> = self.actions.iter_mut().collect();
    while let Some(action) = stack.pop() {
      if action.name == name {
        return Some(StepMut::Action(action));
      }
      stack.extend(action.children_mut());
    }
    None
  }

  /// Mutable access to the piece reference of the named step.
  pub fn step_piece_mut(&mut self, name: &str) -> Option<&mut PiecePackage> {
    match self.get_step_mut(name)? {
      StepMut::Trigger(trigger) => match &mut trigger.kind {
        TriggerKind::Piece(settings) => Some(&mut settings.piece),
        TriggerKind::Empty | TriggerKind::Webhook => None,
      },
      StepMut::Action(action) => match &mut action.kind {
        ActionKind::Piece(settings) => Some(&mut settings.piece),
        _ => None,
      },
    }
  }

  /// Names of every step that references a piece.
  pub fn piece_step_names(&self) -> Vec<String> {
    let mut names = Vec::new();
    if StepRef::Trigger(&self.trigger).piece().is_some() {
      names.push(self.trigger.name.clone());
    }
    for action in self.all_actions() {
      if StepRef::Action(action).piece().is_some() {
        names.push(action.name.clone());
      }
    }
    names
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn sample_flow() -> FlowVersion {
    serde_json::from_value(json!({
      "id": "fv_1",
      "flow_id": "flow_1",
      "display_name": "Sample",
      "state": "DRAFT",
      "trigger": { "name": "trigger", "type": "WEBHOOK" },
      "actions": [
        {
          "name": "step_1",
          "type": "CODE",
          "source_code": { "code": "return 1" }
        },
        {
          "name": "step_2",
          "type": "BRANCH",
          "conditions": [[{ "first_value": "{{ step_1 }}", "operator": "NUMBER_EQUALS", "second_value": "1" }]],
          "on_success": [
            {
              "name": "step_3",
              "type": "PIECE",
              "piece": { "name": "math", "version": "^1.0.0" },
              "action_name": "add",
              "input": { "a": "1", "b": "2" }
            }
          ],
          "on_failure": [
            {
              "name": "step_4",
              "type": "LOOP_ON_ITEMS",
              "items": "{{ trigger.items }}",
              "body": [
                {
                  "name": "step_5",
                  "type": "CODE",
                  "source_code": { "code": "return inputs.x" }
                },
                {
                  "name": "step_6",
                  "type": "PIECE",
                  "piece": { "name": "math", "version": "^1.0.0" },
                  "action_name": "add"
                }
              ]
            }
          ]
        }
      ]
    }))
    .unwrap()
  }

  #[test]
  fn test_get_step_searches_nested_actions() {
    let flow = sample_flow();
    assert!(matches!(flow.get_step("trigger"), Some(StepRef::Trigger(_))));
    assert_eq!(flow.get_step("step_5").map(|s| s.name().to_string()), Some("step_5".to_string()));
    assert!(flow.get_step("missing").is_none());
  }

  #[test]
  fn test_all_actions_depth_first() {
    let flow = sample_flow();
    let names: Vec<&str> = flow.all_actions().iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["step_1", "step_2", "step_3", "step_4", "step_5", "step_6"]);
  }

  #[test]
  fn test_code_artifacts_carry_flow_state() {
    let flow = sample_flow();
    let artifacts = flow.code_artifacts();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[0].name, "step_1");
    assert_eq!(artifacts[1].name, "step_5");
    assert!(artifacts.iter().all(|a| a.flow_version_id == "fv_1"));
    assert!(artifacts.iter().all(|a| !a.is_immutable()));
  }

  #[test]
  fn test_piece_packages_include_duplicates() {
    let flow = sample_flow();
    assert_eq!(flow.piece_packages().len(), 2);
    assert_eq!(flow.piece_step_names(), vec!["step_3", "step_6"]);
  }

  #[test]
  fn test_step_ref_borrows_outlive_the_ref() {
    let flow = sample_flow();
    let (name, piece) = {
      let step = flow.get_step("step_3").unwrap();
      (step.name(), step.piece())
    };
    assert_eq!(name, "step_3");
    assert_eq!(piece.map(|p| p.name.as_str()), Some("math"));

    let pieces = flow.piece_packages();
    assert!(pieces.iter().all(|p| p.version == "^1.0.0"));
  }

  #[test]
  fn test_step_piece_mut_rewrites_nested_step() {
    let mut flow = sample_flow();
    flow.step_piece_mut("step_6").unwrap().pinned_version = Some("1.2.0".to_string());

    let piece = flow.get_step("step_6").and_then(|s| s.piece().cloned()).unwrap();
    assert_eq!(piece.exact_version(), Some("1.2.0"));
    assert!(flow.step_piece_mut("step_1").is_none());
  }

  #[test]
  fn test_flow_round_trips_through_json() {
    let flow = sample_flow();
    let value = serde_json::to_value(&flow).unwrap();
    let back: FlowVersion = serde_json::from_value(value).unwrap();
    assert_eq!(back, flow);
  }
}
