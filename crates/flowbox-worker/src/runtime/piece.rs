//! Calls into piece packages: actions, trigger hooks, dynamic properties,
//! auth validation and metadata.

use std::collections::HashMap;

use mlua::{Function, Table};
use serde_json::{Map, Value, json};

use flowbox_catalog::PieceManifest;
use flowbox_flow::{
  ExecutePropertyOperation, ExecuteTriggerOperation, ExecuteValidateAuthOperation,
  ExtractPieceMetadataOperation, FlowVersion, PieceActionSettings, PiecePackage,
  PieceTriggerSettings, TriggerHookType, TriggerKind,
};

use super::input::{SchemaType, coerce_inputs, render_inputs};
use super::output::{PieceMetadata, PropertyResult, TriggerHookResult, ValidateAuthResult};
use super::session::Session;
use super::{Abort, Fault, settle};

/// The step a piece call is made for.
pub(crate) struct StepContext<'a> {
  pub project_id: &'a str,
  pub flow: &'a FlowVersion,
  pub step_name: &'a str,
}

impl StepContext<'_> {
  fn base(&self) -> Map<String, Value> {
    let mut ctx = Map::new();
    ctx.insert("project_id".to_string(), json!(self.project_id));
    ctx.insert(
      "flow".to_string(),
      json!({ "id": self.flow.flow_id, "version_id": self.flow.id }),
    );
    ctx.insert("step".to_string(), json!({ "name": self.step_name }));
    ctx
  }
}

/// Run a piece action with already rendered inputs.
pub(crate) fn run_action(
  session: &mut Session,
  step: &StepContext,
  settings: &PieceActionSettings,
  rendered: Map<String, Value>,
) -> Result<Value, Fault> {
  let piece = session.piece(&settings.piece)?;
  let action = member(session, &piece, "actions", &settings.action_name)?.ok_or_else(|| {
    Fault::Step(format!(
      "action '{}' not found in piece {}",
      settings.action_name, settings.piece
    ))
  })?;

  let props = field::<Table>(session, &action, "props")?;
  let values = coerce_props(session, step.step_name, &props, rendered)?;
  check_required(session, &props, &values)?;

  let mut ctx = step.base();
  ctx.insert("props".to_string(), values);
  ctx.insert("auth".to_string(), settings.auth.clone().unwrap_or(Value::Null));

  let run = field::<Function>(session, &action, "run")?;
  call(session, &run, &Value::Object(ctx))
}

/// Run one hook of a piece trigger. `RUN` and `TEST` return the produced
/// items; `ON_ENABLE` and `ON_DISABLE` return nothing.
pub(crate) fn run_trigger(
  session: &mut Session,
  step: &StepContext,
  settings: &PieceTriggerSettings,
  rendered: Map<String, Value>,
  hook: TriggerHookType,
  payload: Value,
  webhook_url: Option<&str>,
) -> Result<Vec<Value>, Fault> {
  let piece = session.piece(&settings.piece)?;
  let trigger = member(session, &piece, "triggers", &settings.trigger_name)?.ok_or_else(|| {
    Fault::Step(format!(
      "trigger '{}' not found in piece {}",
      settings.trigger_name, settings.piece
    ))
  })?;

  let props = field::<Table>(session, &trigger, "props")?;
  let values = coerce_props(session, step.step_name, &props, rendered)?;
  check_required(session, &props, &values)?;

  let mut ctx = step.base();
  ctx.insert("props".to_string(), values);
  ctx.insert("auth".to_string(), settings.auth.clone().unwrap_or(Value::Null));
  ctx.insert("payload".to_string(), payload);
  ctx.insert("webhook_url".to_string(), json!(webhook_url));
  let ctx = Value::Object(ctx);

  let hook_name = match hook {
    TriggerHookType::OnEnable => "on_enable",
    TriggerHookType::OnDisable => "on_disable",
    TriggerHookType::Run => "run",
    TriggerHookType::Test => "test",
  };

  match field::<Option<Function>>(session, &trigger, hook_name)? {
    Some(function) => {
      let output = call(session, &function, &ctx)?;
      Ok(match hook {
        TriggerHookType::Run | TriggerHookType::Test => items(output),
        TriggerHookType::OnEnable | TriggerHookType::OnDisable => Vec::new(),
      })
    }
    None => match hook {
      TriggerHookType::OnEnable | TriggerHookType::OnDisable => Ok(Vec::new()),
      TriggerHookType::Test => {
        let sample = field::<mlua::Value>(session, &trigger, "sample_data")?;
        Ok(items(session.from_lua(sample)?))
      }
      TriggerHookType::Run => Err(Fault::Step(format!(
        "trigger '{}' has no run function",
        settings.trigger_name
      ))),
    },
  }
}

pub(crate) fn execute_trigger_hook(
  session: &mut Session,
  op: &ExecuteTriggerOperation,
) -> Result<TriggerHookResult, Abort> {
  let trigger = &op.flow_version.trigger;
  let settings = match &trigger.kind {
    TriggerKind::Piece(settings) => settings,
    TriggerKind::Empty | TriggerKind::Webhook => {
      // Nothing to register; the payload is the output.
      let output = match op.hook_type {
        TriggerHookType::Run | TriggerHookType::Test => {
          op.trigger_payload.clone().map(items).unwrap_or_default()
        }
        TriggerHookType::OnEnable | TriggerHookType::OnDisable => Vec::new(),
      };
      return Ok(TriggerHookResult {
        success: true,
        output,
        message: None,
      });
    }
  };

  let step = StepContext {
    project_id: &op.project_id,
    flow: &op.flow_version,
    step_name: &trigger.name,
  };
  let result = render_inputs(&trigger.name, &settings.input, &Map::new())
    .map_err(Fault::from)
    .and_then(|rendered| {
      run_trigger(
        session,
        &step,
        settings,
        rendered,
        op.hook_type,
        op.trigger_payload.clone().unwrap_or(Value::Null),
        op.webhook_url.as_deref(),
      )
    });

  settle(
    result,
    |output| TriggerHookResult {
      success: true,
      output,
      message: None,
    },
    |message| TriggerHookResult {
      success: false,
      output: Vec::new(),
      message: Some(message),
    },
  )
}

pub(crate) fn execute_property(
  session: &mut Session,
  op: &ExecutePropertyOperation,
) -> Result<PropertyResult, Abort> {
  settle(
    property_options(session, op),
    |options| PropertyResult {
      success: true,
      options,
      message: None,
    },
    |message| PropertyResult {
      success: false,
      options: Value::Null,
      message: Some(message),
    },
  )
}

fn property_options(session: &mut Session, op: &ExecutePropertyOperation) -> Result<Value, Fault> {
  let piece = session.piece(&op.piece)?;
  let name = &op.action_or_trigger_name;
  let owner = match member(session, &piece, "actions", name)? {
    Some(action) => action,
    None => member(session, &piece, "triggers", name)?.ok_or_else(|| {
      Fault::Step(format!(
        "action or trigger '{}' not found in piece {}",
        name, op.piece
      ))
    })?,
  };

  let props = field::<Table>(session, &owner, "props")?;
  let prop = field::<Option<Table>>(session, &props, &op.property_name)?.ok_or_else(|| {
    Fault::Step(format!(
      "property '{}' not found on '{}'",
      op.property_name, name
    ))
  })?;

  match field::<mlua::Value>(session, &prop, "options")? {
    mlua::Value::Function(options) => {
      // Other props are usually half filled in; only coerce them.
      let rendered = render_inputs(name, &op.input, &Map::new())?;
      let values = coerce_props(session, name, &props, rendered)?;

      let mut ctx = Map::new();
      ctx.insert("project_id".to_string(), json!(op.project_id));
      ctx.insert("props".to_string(), values);
      ctx.insert("auth".to_string(), op.auth.clone().unwrap_or(Value::Null));
      call(session, &options, &Value::Object(ctx))
    }
    mlua::Value::Nil => Err(Fault::Step(format!(
      "property '{}' has no options",
      op.property_name
    ))),
    options => session.from_lua(options),
  }
}

pub(crate) fn execute_validate_auth(
  session: &mut Session,
  op: &ExecuteValidateAuthOperation,
) -> Result<ValidateAuthResult, Abort> {
  settle(
    validate_auth(session, &op.piece, &op.auth),
    |result| result,
    |message| ValidateAuthResult {
      valid: false,
      error: Some(message),
    },
  )
}

fn validate_auth(
  session: &mut Session,
  piece: &PiecePackage,
  auth: &Value,
) -> Result<ValidateAuthResult, Fault> {
  let piece = session.piece(piece)?;
  let validate = match field::<Option<Table>>(session, &piece, "auth")? {
    Some(auth) => field::<Option<Function>>(session, &auth, "validate")?,
    None => None,
  };
  let Some(validate) = validate else {
    return Ok(ValidateAuthResult {
      valid: true,
      error: None,
    });
  };

  let response = call(session, &validate, auth)?;
  serde_json::from_value(response)
    .map_err(|e| Fault::Step(format!("invalid auth validation response: {}", e)))
}

pub(crate) fn extract_metadata(
  session: &mut Session,
  op: &ExtractPieceMetadataOperation,
) -> Result<PieceMetadata, Abort> {
  match describe(session, &op.piece) {
    Ok(metadata) => Ok(metadata),
    Err(Fault::Step(message)) => Err(Abort::Internal(format!(
      "failed to extract metadata of {}: {}",
      op.piece, message
    ))),
    Err(Fault::Abort(abort)) => Err(abort),
  }
}

fn describe(session: &mut Session, piece: &PiecePackage) -> Result<PieceMetadata, Fault> {
  let table = session.piece(piece)?;
  let describe = field::<Function>(session, session.engine(), "describe")?;
  let description = describe
    .call::<mlua::Value>(table)
    .map_err(|e| session.fault(e))?;

  let mut metadata = match session.from_lua(description)? {
    Value::Object(map) => map,
    other => {
      return Err(Fault::Step(format!(
        "piece description is not an object: {}",
        other
      )));
    }
  };

  let manifest_path = session.layout().piece_dir(piece).join("manifest.json");
  let (name, version) = std::fs::read_to_string(&manifest_path)
    .ok()
    .and_then(|text| serde_json::from_str::<PieceManifest>(&text).ok())
    .map(|manifest| (manifest.name, manifest.version))
    .unwrap_or_else(|| {
      (
        piece.name.clone(),
        piece.exact_version().unwrap_or(&piece.version).to_string(),
      )
    });
  metadata.insert("name".to_string(), json!(name));
  metadata.insert("version".to_string(), json!(version));

  serde_json::from_value(Value::Object(metadata))
    .map_err(|e| Fault::Step(format!("invalid piece description: {}", e)))
}

/// Coerce rendered inputs to the declared prop types.
fn coerce_props(
  session: &Session,
  step_name: &str,
  props: &Table,
  rendered: Map<String, Value>,
) -> Result<Value, Fault> {
  let prop_types = field::<Function>(session, session.engine(), "prop_types")?;
  let types = prop_types
    .call::<HashMap<String, String>>(props.clone())
    .map_err(|e| session.fault(e))?;
  let schema: HashMap<String, SchemaType> = types
    .iter()
    .map(|(name, prop_type)| (name.clone(), SchemaType::from_prop_type(prop_type)))
    .collect();
  Ok(coerce_inputs(step_name, rendered, &schema)?)
}

fn check_required(session: &Session, props: &Table, values: &Value) -> Result<(), Fault> {
  let mut missing = Vec::new();
  for pair in props.clone().pairs::<String, mlua::Value>() {
    let (name, prop) = pair.map_err(|e| session.fault(e))?;
    let mlua::Value::Table(prop) = prop else {
      continue;
    };
    let required = field::<Option<bool>>(session, &prop, "required")?.unwrap_or(false);
    if required && values.get(&name).is_none_or(Value::is_null) {
      missing.push(name);
    }
  }

  if missing.is_empty() {
    return Ok(());
  }
  missing.sort();
  Err(Fault::Step(format!(
    "missing required props: {}",
    missing.join(", ")
  )))
}

/// `piece[group][name]`, where `group` is `actions` or `triggers`.
fn member(session: &Session, piece: &Table, group: &str, name: &str) -> Result<Option<Table>, Fault> {
  match field::<Option<Table>>(session, piece, group)? {
    Some(members) => field::<Option<Table>>(session, &members, name),
    None => Ok(None),
  }
}

fn field<V: mlua::FromLua>(session: &Session, table: &Table, key: &str) -> Result<V, Fault> {
  table.get::<V>(key).map_err(|e| session.fault(e))
}

fn call(session: &Session, function: &Function, argument: &Value) -> Result<Value, Fault> {
  let argument = session.to_lua(argument)?;
  let result = function
    .call::<mlua::Value>(argument)
    .map_err(|e| session.fault(e))?;
  session.from_lua(result)
}

/// Items produced by a trigger: arrays are used as is, anything else is a
/// single item.
pub(crate) fn items(output: Value) -> Vec<Value> {
  match output {
    Value::Array(items) => items,
    Value::Null => Vec::new(),
    other => vec![other],
  }
}
