//! Flow interpretation: the trigger, then every action in order, with
//! branches and loops running their child actions.

use std::time::Instant;

use serde_json::{Map, Value, json};
use tracing::debug;

use flowbox_flow::{
  Action, ActionKind, BranchSettings, ExecuteFlowOperation, ExecuteStepOperation, FlowVersion,
  LoopSettings, StepRef, Trigger, TriggerHookType, TriggerKind,
};

use super::input::{InputError, render_inputs, render_value};
use super::output::{FailedStep, FlowRunResponse, FlowRunStatus, StepOutput, StepStatus};
use super::piece::{self, StepContext};
use super::session::Session;
use super::{Abort, Fault};

/// Context key every trigger output is also stored under.
const TRIGGER_KEY: &str = "trigger";

/// Context key of the current loop item.
const LOOP_KEY: &str = "loop";

pub(crate) fn execute_flow(
  session: &mut Session,
  op: &ExecuteFlowOperation,
) -> Result<FlowRunResponse, Abort> {
  let started = Instant::now();
  let mut run = Run::new(session, &op.project_id, &op.flow_version, Map::new());

  let mut failed_step = run.run_trigger(&op.flow_version.trigger, op.trigger_payload.clone())?;
  if failed_step.is_none() {
    failed_step = run.run_actions(&op.flow_version.actions)?;
  }

  let status = match failed_step {
    Some(_) => FlowRunStatus::Failed,
    None => FlowRunStatus::Succeeded,
  };
  Ok(FlowRunResponse {
    status,
    steps: run.steps,
    failed_step,
    duration_ms: elapsed_ms(started),
  })
}

/// Run a single step with `sample_data` as the context. Branches only
/// evaluate their conditions and loops only render their items.
pub(crate) fn execute_step(
  session: &mut Session,
  op: &ExecuteStepOperation,
) -> Result<StepOutput, Abort> {
  let step = op.flow_version.get_step(&op.step_name).ok_or_else(|| {
    Abort::Internal(format!(
      "step '{}' not found in flow version {}",
      op.step_name, op.flow_version.id
    ))
  })?;

  let started = Instant::now();
  let mut run = Run::new(
    session,
    &op.project_id,
    &op.flow_version,
    op.sample_data.clone(),
  );
  let attempt = match step {
    StepRef::Trigger(trigger) => {
      let payload = op
        .sample_data
        .get(&trigger.name)
        .cloned()
        .unwrap_or(Value::Null);
      run.trigger_attempt(trigger, payload)?
    }
    StepRef::Action(action) => run.single_action(action)?,
  };
  Ok(step_output(&op.step_name, started, attempt))
}

/// Input and result of one step.
struct Attempt {
  input: Value,
  output: Result<Value, String>,
}

impl Attempt {
  fn settle(input: Value, result: Result<Value, Fault>) -> Result<Self, Abort> {
    match result {
      Ok(output) => Ok(Self {
        input,
        output: Ok(output),
      }),
      Err(Fault::Step(message)) => Ok(Self {
        input,
        output: Err(message),
      }),
      Err(Fault::Abort(abort)) => Err(abort),
    }
  }

  /// A step whose inputs could not be rendered.
  fn unrendered(err: InputError) -> Self {
    Self {
      input: Value::Null,
      output: Err(err.to_string()),
    }
  }
}

struct Run<'a> {
  session: &'a mut Session,
  project_id: &'a str,
  flow: &'a FlowVersion,
  /// `trigger` and each completed step name mapped to its output.
  context: Map<String, Value>,
  steps: Vec<StepOutput>,
}

impl<'a> Run<'a> {
  fn new(
    session: &'a mut Session,
    project_id: &'a str,
    flow: &'a FlowVersion,
    context: Map<String, Value>,
  ) -> Self {
    Self {
      session,
      project_id,
      flow,
      context,
      steps: Vec::new(),
    }
  }

  fn step_context<'s>(&self, step_name: &'s str) -> StepContext<'s>
  where
    'a: 's,
  {
    StepContext {
      project_id: self.project_id,
      flow: self.flow,
      step_name,
    }
  }

  fn run_trigger(&mut self, trigger: &Trigger, payload: Value) -> Result<Option<FailedStep>, Abort> {
    let started = Instant::now();
    let attempt = self.trigger_attempt(trigger, payload)?;
    if let Ok(output) = &attempt.output {
      self.context.insert(TRIGGER_KEY.to_string(), output.clone());
    }
    Ok(self.record(&trigger.name, started, attempt))
  }

  /// The trigger output is the payload; piece triggers turn it into their
  /// first produced item.
  fn trigger_attempt(&mut self, trigger: &Trigger, payload: Value) -> Result<Attempt, Abort> {
    let settings = match &trigger.kind {
      TriggerKind::Empty | TriggerKind::Webhook => {
        return Ok(Attempt {
          input: payload.clone(),
          output: Ok(payload),
        });
      }
      TriggerKind::Piece(settings) => settings,
    };

    let rendered = match render_inputs(&trigger.name, &settings.input, &self.context) {
      Ok(rendered) => rendered,
      Err(err) => return Ok(Attempt::unrendered(err)),
    };
    let input = Value::Object(rendered.clone());
    let step = self.step_context(&trigger.name);
    let result = piece::run_trigger(
      self.session,
      &step,
      settings,
      rendered,
      TriggerHookType::Run,
      payload,
      None,
    )
    .map(|items| items.into_iter().next().unwrap_or(Value::Null));
    Attempt::settle(input, result)
  }

  fn run_actions(&mut self, actions: &[Action]) -> Result<Option<FailedStep>, Abort> {
    for action in actions {
      if let Some(failed) = self.run_action(action)? {
        return Ok(Some(failed));
      }
    }
    Ok(None)
  }

  fn run_action(&mut self, action: &Action) -> Result<Option<FailedStep>, Abort> {
    let started = Instant::now();
    match &action.kind {
      ActionKind::Code(_) | ActionKind::Piece(_) => {
        let attempt = self.single_action(action)?;
        Ok(self.record(&action.name, started, attempt))
      }
      ActionKind::Branch(settings) => {
        let (input, matched) = match self.evaluate_branch(&action.name, settings) {
          Ok(evaluated) => evaluated,
          Err(err) => return Ok(self.record(&action.name, started, Attempt::unrendered(err))),
        };
        let attempt = Attempt {
          input,
          output: Ok(json!({ "condition": matched })),
        };
        if let Some(failed) = self.record(&action.name, started, attempt) {
          return Ok(Some(failed));
        }
        let children = if matched {
          &settings.on_success
        } else {
          &settings.on_failure
        };
        self.run_actions(children)
      }
      ActionKind::LoopOnItems(settings) => self.run_loop(action, settings, started),
    }
  }

  /// Run a code or piece action, or evaluate a branch or loop without running
  /// its children.
  fn single_action(&mut self, action: &Action) -> Result<Attempt, Abort> {
    match &action.kind {
      ActionKind::Code(settings) => {
        let rendered = match render_inputs(&action.name, &settings.input, &self.context) {
          Ok(rendered) => rendered,
          Err(err) => return Ok(Attempt::unrendered(err)),
        };
        let input = Value::Object(rendered);
        let key = self
          .flow
          .code_artifact_for(action)
          .map(|artifact| artifact.key())
          .ok_or_else(|| Abort::Internal(format!("'{}' is not a code step", action.name)))?;
        let result = self.session.run_code(&key, &input);
        Attempt::settle(input, result)
      }
      ActionKind::Piece(settings) => {
        let rendered = match render_inputs(&action.name, &settings.input, &self.context) {
          Ok(rendered) => rendered,
          Err(err) => return Ok(Attempt::unrendered(err)),
        };
        let input = Value::Object(rendered.clone());
        let step = self.step_context(&action.name);
        let result = piece::run_action(self.session, &step, settings, rendered);
        Attempt::settle(input, result)
      }
      ActionKind::Branch(settings) => Ok(match self.evaluate_branch(&action.name, settings) {
        Ok((input, matched)) => Attempt {
          input,
          output: Ok(json!({ "condition": matched })),
        },
        Err(err) => Attempt::unrendered(err),
      }),
      ActionKind::LoopOnItems(settings) => Ok(match self.loop_items(&action.name, settings) {
        Ok(items) => Attempt {
          input: json!({ "items": settings.items }),
          output: Ok(json!({ "count": items.len(), "items": items })),
        },
        Err(message) => Attempt {
          input: json!({ "items": settings.items }),
          output: Err(message),
        },
      }),
    }
  }

  /// Render every condition and report whether any group holds entirely.
  fn evaluate_branch(
    &self,
    step_name: &str,
    settings: &BranchSettings,
  ) -> Result<(Value, bool), InputError> {
    let mut groups = Vec::with_capacity(settings.conditions.len());
    let mut matched = false;

    for group in &settings.conditions {
      let mut rendered = Vec::with_capacity(group.len());
      let mut holds = true;
      for condition in group {
        let first = render_value(step_name, &condition.first_value, &self.context)?;
        let second = condition
          .second_value
          .as_deref()
          .map(|template| render_value(step_name, template, &self.context))
          .transpose()?;
        holds &= condition.operator.evaluate(&first, second.as_ref());
        rendered.push(json!({
          "first_value": first,
          "operator": condition.operator,
          "second_value": second,
        }));
      }
      matched |= holds;
      groups.push(Value::Array(rendered));
    }

    Ok((json!({ "conditions": groups }), matched))
  }

  fn loop_items(&self, step_name: &str, settings: &LoopSettings) -> Result<Vec<Value>, String> {
    let items = render_value(step_name, &settings.items, &self.context).map_err(|e| e.to_string())?;
    match items {
      Value::Array(items) => Ok(items),
      // A template mixing text renders to a string; accept JSON arrays.
      Value::String(text) => match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(items)) => Ok(items),
        _ => Err(format!("loop items must be an array, got '{}'", text)),
      },
      other => Err(format!("loop items must be an array, got {}", other)),
    }
  }

  fn run_loop(
    &mut self,
    action: &Action,
    settings: &LoopSettings,
    started: Instant,
  ) -> Result<Option<FailedStep>, Abort> {
    let items = match self.loop_items(&action.name, settings) {
      Ok(items) => items,
      Err(message) => {
        let attempt = Attempt {
          input: json!({ "items": settings.items }),
          output: Err(message),
        };
        return Ok(self.record(&action.name, started, attempt));
      }
    };
    let input = json!({ "items": items });

    let body_steps = step_names(&settings.body);
    let outer = self.context.remove(LOOP_KEY);
    let mut iterations = Vec::with_capacity(items.len());
    let mut failed = None;

    for (index, item) in items.into_iter().enumerate() {
      for name in &body_steps {
        self.context.remove(name);
      }
      self
        .context
        .insert(LOOP_KEY.to_string(), json!({ "item": item, "index": index + 1 }));

      failed = self.run_actions(&settings.body)?;
      iterations.push(self.collect_outputs(&body_steps));
      if failed.is_some() {
        break;
      }
    }

    match outer {
      Some(outer) => self.context.insert(LOOP_KEY.to_string(), outer),
      None => self.context.remove(LOOP_KEY),
    };
    if failed.is_some() {
      return Ok(failed);
    }

    let attempt = Attempt {
      input,
      output: Ok(json!({ "iterations": iterations })),
    };
    Ok(self.record(&action.name, started, attempt))
  }

  fn collect_outputs(&self, names: &[String]) -> Value {
    let outputs: Map<String, Value> = names
      .iter()
      .filter_map(|name| {
        self
          .context
          .get(name)
          .map(|output| (name.clone(), output.clone()))
      })
      .collect();
    Value::Object(outputs)
  }

  /// Store the step result and, on success, make its output available to
  /// later steps.
  fn record(&mut self, step_name: &str, started: Instant, attempt: Attempt) -> Option<FailedStep> {
    let output = step_output(step_name, started, attempt);
    let failed = match output.status {
      StepStatus::Succeeded => {
        debug!(step = step_name, duration_ms = output.duration_ms, "step_succeeded");
        self.context.insert(
          step_name.to_string(),
          output.output.clone().unwrap_or(Value::Null),
        );
        None
      }
      StepStatus::Failed => {
        let message = output.error_message.clone().unwrap_or_default();
        debug!(step = step_name, error = %message, "step_failed");
        Some(FailedStep {
          step_name: step_name.to_string(),
          message,
        })
      }
    };
    self.steps.push(output);
    failed
  }
}

fn step_output(step_name: &str, started: Instant, attempt: Attempt) -> StepOutput {
  let duration_ms = elapsed_ms(started);
  match attempt.output {
    Ok(output) => StepOutput {
      step_name: step_name.to_string(),
      status: StepStatus::Succeeded,
      input: attempt.input,
      output: Some(output),
      error_message: None,
      duration_ms,
    },
    Err(message) => StepOutput {
      step_name: step_name.to_string(),
      status: StepStatus::Failed,
      input: attempt.input,
      output: None,
      error_message: Some(message),
      duration_ms,
    },
  }
}

/// Names of `actions` and every action nested below them.
fn step_names(actions: &[Action]) -> Vec<String> {
  let mut names = Vec::new();
  let mut pending: Vec<&Action> = actions.iter().rev().collect();
  while let Some(action) = pending.pop() {
    names.push(action.name.clone());
    pending.extend(action.children().into_iter().rev());
  }
  names
}

fn elapsed_ms(started: Instant) -> u64 {
  u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
