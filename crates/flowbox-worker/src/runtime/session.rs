//! One Lua state, created for a single task and dropped with it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{
  DeserializeOptions, Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue,
  SerializeOptions, StdLib, Table, VmState,
};

use flowbox_flow::{ArtifactKey, PiecePackage};
use flowbox_sandbox::{SandboxLayout, sanitize_segment};

use super::{Abort, Fault};
use crate::task::{EngineResponseStatus, UnitOutcome};
use crate::unit::UnitSettings;

/// Registry table caching loaded modules by file path.
const MODULE_CACHE: &str = "flowbox_modules";

/// Instructions between two deadline checks.
const HOOK_INTERVAL: u32 = 1000;

/// Globals removed from every state: they read files or load source at
/// runtime.
const BLOCKED_GLOBALS: [&str; 3] = ["dofile", "loadfile", "load"];

pub(crate) struct Session {
  lua: Lua,
  layout: SandboxLayout,
  engine: Table,
  pieces: HashMap<String, Table>,
  stdout: Arc<Mutex<String>>,
  stderr: Arc<Mutex<String>>,
  timed_out: Arc<AtomicBool>,
  task_timeout: Duration,
  memory_limit_bytes: usize,
}

impl Session {
  /// Create the state, install the limits and load the engine runtime.
  pub(crate) fn open(settings: &UnitSettings) -> Result<Self, Abort> {
    let lua = Lua::new_with(
      StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
      LuaOptions::new(),
    )
    .map_err(|e| Abort::Internal(format!("failed to create Lua state: {}", e)))?;

    let stdout = Arc::new(Mutex::new(String::new()));
    let stderr = Arc::new(Mutex::new(String::new()));
    let timed_out = Arc::new(AtomicBool::new(false));

    install_globals(&lua, &settings.env, &stdout, &stderr)
      .map_err(|e| Abort::Internal(format!("failed to set up Lua state: {}", e)))?;
    lua
      .set_memory_limit(settings.memory_limit_bytes)
      .map_err(|e| Abort::Internal(format!("failed to set memory limit: {}", e)))?;
    install_deadline(&lua, settings.task_timeout, timed_out.clone());

    let engine = load_engine(&lua, &settings.layout)?;

    Ok(Self {
      lua,
      layout: settings.layout.clone(),
      engine,
      pieces: HashMap::new(),
      stdout,
      stderr,
      timed_out,
      task_timeout: settings.task_timeout,
      memory_limit_bytes: settings.memory_limit_bytes,
    })
  }

  pub(crate) fn layout(&self) -> &SandboxLayout {
    &self.layout
  }

  /// The table returned by the engine runtime.
  pub(crate) fn engine(&self) -> &Table {
    &self.engine
  }

  /// Classify an error raised while running user or piece code.
  ///
  /// Deadline and memory exhaustion abort the whole task; anything else is a
  /// failure of the step that raised it.
  pub(crate) fn fault(&self, err: mlua::Error) -> Fault {
    if self.timed_out.load(Ordering::Relaxed) {
      return Fault::Abort(Abort::Timeout);
    }
    match root_cause(&err) {
      mlua::Error::MemoryError(_) => Fault::Abort(Abort::MemoryLimitExceeded),
      cause => Fault::Step(error_message(cause)),
    }
  }

  pub(crate) fn to_lua(&self, value: &serde_json::Value) -> Result<mlua::Value, Fault> {
    self
      .lua
      .to_value_with(
        value,
        SerializeOptions::new()
          .serialize_none_to_null(false)
          .serialize_unit_to_null(false),
      )
      .map_err(|e| self.fault(e))
  }

  pub(crate) fn from_lua(&self, value: mlua::Value) -> Result<serde_json::Value, Fault> {
    self
      .lua
      .from_value_with(value, DeserializeOptions::new().deny_unsupported_types(false))
      .map_err(|e| self.fault(e))
  }

  /// Load an installed piece, once per task.
  pub(crate) fn piece(&mut self, piece: &PiecePackage) -> Result<Table, Fault> {
    let key = piece.dir_name();
    if let Some(table) = self.pieces.get(&key) {
      return Ok(table.clone());
    }

    let root = self.layout.piece_dir(piece);
    let index = root.join("index.lua");
    if !index.exists() {
      return Err(Fault::Step(format!("piece {} is not installed", piece)));
    }
    let table = load_module(&self.lua, &index, &root, &format!("={}", piece))
      .and_then(|value| match value {
        mlua::Value::Table(table) => Ok(table),
        other => Err(mlua::Error::RuntimeError(format!(
          "piece {} returned a {} instead of a piece table",
          piece,
          other.type_name()
        ))),
      })
      .map_err(|e| self.fault(e))?;

    self.pieces.insert(key, table.clone());
    Ok(table)
  }

  /// Load the step function of a compiled code artifact.
  fn code_step(&self, key: &ArtifactKey) -> Result<Function, Fault> {
    let index = self.layout.artifact_index(key);
    if !index.exists() {
      return Err(Fault::Step(format!("code artifact {} is not compiled", key)));
    }
    let modules = self.layout.artifact_modules_dir(key);
    match load_module(&self.lua, &index, &modules, &format!("={}", key.source_code_id)) {
      Ok(mlua::Value::Function(function)) => Ok(function),
      Ok(other) => Err(Fault::Step(format!(
        "code artifact {} evaluated to a {} instead of a function",
        key,
        other.type_name()
      ))),
      Err(e) => Err(self.fault(e)),
    }
  }

  /// Call a code step with its rendered input.
  pub(crate) fn run_code(
    &self,
    key: &ArtifactKey,
    input: &serde_json::Value,
  ) -> Result<serde_json::Value, Fault> {
    let step = self.code_step(key)?;
    let input = self.to_lua(input)?;
    let output = step
      .call::<mlua::Value>(input)
      .map_err(|e| self.fault(e))?;
    self.from_lua(output)
  }

  /// Collect the captured output and turn the task result into an outcome.
  pub(crate) fn finish(self, result: Result<serde_json::Value, Abort>) -> UnitOutcome {
    let stdout = take(&self.stdout);
    let mut stderr = take(&self.stderr);

    let (status, response, message) = match result {
      Ok(response) => (EngineResponseStatus::Ok, Some(response), None),
      Err(Abort::Timeout) => (
        EngineResponseStatus::Timeout,
        None,
        Some(format!(
          "execution exceeded the deadline of {}s",
          self.task_timeout.as_secs_f64()
        )),
      ),
      Err(Abort::MemoryLimitExceeded) => (
        EngineResponseStatus::MemoryLimitExceeded,
        None,
        Some(format!(
          "execution exceeded the memory limit of {} KB",
          self.memory_limit_bytes / 1024
        )),
      ),
      Err(Abort::Internal(message)) => (EngineResponseStatus::InternalError, None, Some(message)),
    };

    if let Some(message) = message {
      if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
      }
      stderr.push_str(&message);
    }

    UnitOutcome {
      status,
      response,
      stdout,
      stderr,
    }
  }
}

fn install_globals(
  lua: &Lua,
  env: &BTreeMap<String, String>,
  stdout: &Arc<Mutex<String>>,
  stderr: &Arc<Mutex<String>>,
) -> mlua::Result<()> {
  let globals = lua.globals();
  for name in BLOCKED_GLOBALS {
    globals.set(name, mlua::Value::Nil)?;
  }
  globals.set("print", capture_output(lua, stdout.clone(), "\t")?)?;
  globals.set("warn", capture_output(lua, stderr.clone(), "")?)?;
  globals.set(
    "env",
    lua.create_table_from(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))?,
  )?;
  lua.set_named_registry_value(MODULE_CACHE, lua.create_table()?)?;
  Ok(())
}

/// Raise an error from every instruction hook once `timeout` has elapsed.
fn install_deadline(lua: &Lua, timeout: Duration, timed_out: Arc<AtomicBool>) {
  let deadline = Instant::now() + timeout;
  let _ = lua.set_hook(
    HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
    move |_lua, _debug| {
      if Instant::now() >= deadline {
        timed_out.store(true, Ordering::Relaxed);
        return Err(mlua::Error::RuntimeError(
          "execution deadline exceeded".to_string(),
        ));
      }
      Ok(VmState::Continue)
    },
  );
}

fn load_engine(lua: &Lua, layout: &SandboxLayout) -> Result<Table, Abort> {
  let path = layout.engine_main();
  let source = std::fs::read_to_string(&path).map_err(|e| {
    Abort::Internal(format!(
      "engine runtime is not installed at {}: {}",
      path.display(),
      e
    ))
  })?;
  lua
    .load(source.as_str())
    .set_name("=engine")
    .eval::<Table>()
    .map_err(|e| match root_cause(&e) {
      mlua::Error::MemoryError(_) => Abort::MemoryLimitExceeded,
      cause => Abort::Internal(format!(
        "failed to load engine runtime: {}",
        error_message(cause)
      )),
    })
}

fn take(buffer: &Mutex<String>) -> String {
  std::mem::take(&mut *buffer.lock().unwrap_or_else(|e| e.into_inner()))
}

/// A `print`-like function writing into `buffer` instead of a host stream.
fn capture_output(
  lua: &Lua,
  buffer: Arc<Mutex<String>>,
  separator: &'static str,
) -> mlua::Result<Function> {
  lua.create_function(move |lua, args: MultiValue| {
    let tostring = lua.globals().get::<Function>("tostring")?;
    let mut line = String::new();
    for (i, value) in args.into_iter().enumerate() {
      if i > 0 {
        line.push_str(separator);
      }
      line.push_str(&tostring.call::<String>(value)?);
    }
    line.push('\n');
    buffer
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push_str(&line);
    Ok(())
  })
}

/// Evaluate a module file in its own environment whose `require` resolves
/// below `root`.
fn load_module(lua: &Lua, path: &Path, root: &Path, chunk_name: &str) -> mlua::Result<mlua::Value> {
  let source = std::fs::read_to_string(path).map_err(mlua::Error::external)?;
  lua
    .load(source.as_str())
    .set_name(chunk_name)
    .set_environment(module_environment(lua, root.to_path_buf())?)
    .eval::<mlua::Value>()
}

fn module_environment(lua: &Lua, root: PathBuf) -> mlua::Result<Table> {
  let env = lua.create_table()?;
  let meta = lua.create_table()?;
  meta.set("__index", lua.globals())?;
  let _ = env.set_metatable(Some(meta));

  let require = lua.create_function(move |lua, name: String| require_module(lua, &root, &name))?;
  env.set("require", require)?;
  Ok(env)
}

fn require_module(lua: &Lua, root: &Path, name: &str) -> mlua::Result<mlua::Value> {
  let path = resolve_module(root, name).ok_or_else(|| {
    mlua::Error::RuntimeError(format!("module '{}' not found", name))
  })?;
  let key = path.display().to_string();

  let cache = lua.named_registry_value::<Table>(MODULE_CACHE)?;
  let cached = cache.get::<mlua::Value>(key.as_str())?;
  if !cached.is_nil() {
    return Ok(cached);
  }

  let value = match load_module(lua, &path, root, &format!("={}", name))? {
    mlua::Value::Nil => mlua::Value::Boolean(true),
    value => value,
  };
  cache.set(key.as_str(), value.clone())?;
  Ok(value)
}

/// Map `a.b.c` to `root/a/b/c.lua` or `root/a/b/c/index.lua`. Every segment
/// is sanitized, so the result never leaves `root`.
fn resolve_module(root: &Path, name: &str) -> Option<PathBuf> {
  let mut base = root.to_path_buf();
  for segment in name.split('.') {
    base.push(sanitize_segment(segment));
  }

  let file = base.with_extension("lua");
  if file.is_file() {
    return Some(file);
  }
  let index = base.join("index.lua");
  index.is_file().then_some(index)
}

fn root_cause(err: &mlua::Error) -> &mlua::Error {
  match err {
    mlua::Error::CallbackError { cause, .. } => root_cause(cause),
    mlua::Error::WithContext { cause, .. } => root_cause(cause),
    other => other,
  }
}

fn error_message(err: &mlua::Error) -> String {
  let text = match err {
    mlua::Error::RuntimeError(message) => message.clone(),
    other => other.to_string(),
  };
  match text.find("\nstack traceback:") {
    Some(end) => text[..end].to_string(),
    None => text,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_module_prefers_file_then_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("lib/util")).unwrap();
    std::fs::write(dir.path().join("lib/util/index.lua"), "return {}").unwrap();
    std::fs::write(dir.path().join("helpers.lua"), "return {}").unwrap();

    assert_eq!(
      resolve_module(dir.path(), "lib.util"),
      Some(dir.path().join("lib/util/index.lua"))
    );
    assert_eq!(
      resolve_module(dir.path(), "helpers"),
      Some(dir.path().join("helpers.lua"))
    );
    assert_eq!(resolve_module(dir.path(), "missing"), None);
  }

  #[test]
  fn test_resolve_module_stays_below_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("modules");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(dir.path().join("secret.lua"), "return 1").unwrap();

    assert_eq!(resolve_module(&root, "..secret"), None);
    assert_eq!(resolve_module(&root, "../secret"), None);
  }

  #[test]
  fn test_error_message_drops_traceback() {
    let err = mlua::Error::RuntimeError("boom\nstack traceback:\n\t[C]: in ?".to_string());
    assert_eq!(error_message(&err), "boom");
  }

  #[test]
  fn test_root_cause_unwraps_callbacks() {
    let err = mlua::Error::CallbackError {
      traceback: String::new(),
      cause: Arc::new(mlua::Error::MemoryError("not enough memory".to_string())),
    };
    assert!(matches!(root_cause(&err), mlua::Error::MemoryError(_)));
  }
}
