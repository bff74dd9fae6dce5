use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use flowbox_engine::{EngineConfig, EngineRunner, SandboxEngineRunner};
use flowbox_flow::{
  EngineOperation, ExecuteFlowOperation, ExecutePropertyOperation, ExecuteStepOperation,
  ExecuteTriggerOperation, ExecuteValidateAuthOperation, ExtractPieceMetadataOperation,
  FlowVersion, PiecePackage, TriggerHookType,
};
use flowbox_worker::EngineResponseStatus;

/// Flowbox - run flows and pieces in an isolated Lua sandbox
#[derive(Parser)]
#[command(name = "flowbox")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(flatten)]
  settings: Settings,

  #[command(subcommand)]
  command: Option<Commands>,
}

/// Engine settings. Each flag falls back to its `FLOWBOX_*` variable.
#[derive(Args)]
struct Settings {
  /// Data directory (default: ~/.flowbox)
  #[arg(long, global = true, env = "FLOWBOX_DATA_DIR")]
  data_dir: Option<PathBuf>,

  /// Piece catalog directory (default: <data-dir>/pieces)
  #[arg(long, global = true, env = "FLOWBOX_CATALOG_DIR")]
  catalog_dir: Option<PathBuf>,

  /// Sandbox directory (default: <data-dir>/sandbox)
  #[arg(long, global = true, env = "FLOWBOX_SANDBOX_DIR")]
  sandbox_dir: Option<PathBuf>,

  /// Memory budget per execution unit, in KB
  #[arg(long, global = true, env = "FLOWBOX_MEMORY_LIMIT_KB")]
  memory_limit_kb: Option<u64>,

  /// Number of execution units
  #[arg(long, global = true, env = "FLOWBOX_CONCURRENCY")]
  concurrency: Option<usize>,

  /// Deadline of one operation, in seconds
  #[arg(long, global = true, env = "FLOWBOX_TASK_TIMEOUT_SECS")]
  timeout_secs: Option<u64>,

  /// Release of this host, checked against piece release windows
  #[arg(long, global = true, env = "FLOWBOX_HOST_RELEASE")]
  host_release: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a flow or a single step
  Run {
    #[command(subcommand)]
    target: RunTarget,
  },

  /// Run a hook of a flow's trigger. The payload is read from stdin.
  Trigger {
    /// Path to the flow version file (JSON)
    flow_file: PathBuf,

    #[arg(long, value_enum)]
    hook: Hook,

    #[arg(long)]
    webhook_url: Option<String>,
  },

  /// Work with a piece directly
  Piece {
    #[command(subcommand)]
    command: PieceCommand,
  },

  /// Execute an engine operation read from a JSON file
  Exec {
    operation_file: PathBuf,
  },
}

#[derive(Subcommand)]
enum RunTarget {
  /// Run an entire flow. The trigger payload is read from stdin.
  Flow {
    /// Path to the flow version file (JSON)
    flow_file: PathBuf,
  },

  /// Run a single step. Sample data (step name to output) is read from stdin.
  Step {
    /// Path to the flow version file (JSON)
    flow_file: PathBuf,

    /// The step to execute
    #[arg(long)]
    step: String,
  },
}

#[derive(Subcommand)]
enum PieceCommand {
  /// Print what a piece declares
  Metadata {
    name: String,
    /// Exact version or range
    #[arg(default_value = "*")]
    range: String,
  },

  /// Check credentials with the piece's auth validator
  ValidateAuth {
    name: String,
    #[arg(default_value = "*")]
    range: String,
    /// Auth value as JSON; plain text is passed as a string
    #[arg(long)]
    auth: String,
  },

  /// Load the options of a dropdown property
  Prop {
    name: String,
    #[arg(default_value = "*")]
    range: String,
    /// Action or trigger owning the property
    #[arg(long)]
    target: String,
    #[arg(long)]
    prop: String,
    /// Other prop values as key=template
    #[arg(long = "input", value_parser = parse_key_value)]
    inputs: Vec<(String, String)>,
    /// Auth value as JSON
    #[arg(long)]
    auth: Option<String>,
  },
}

#[derive(Clone, Copy, ValueEnum)]
enum Hook {
  OnEnable,
  OnDisable,
  Run,
  Test,
}

impl From<Hook> for TriggerHookType {
  fn from(hook: Hook) -> Self {
    match hook {
      Hook::OnEnable => TriggerHookType::OnEnable,
      Hook::OnDisable => TriggerHookType::OnDisable,
      Hook::Run => TriggerHookType::Run,
      Hook::Test => TriggerHookType::Test,
    }
  }
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowbox=info")),
    )
    .with_writer(io::stderr)
    .init();

  let Some(command) = cli.command else {
    println!("flowbox - use --help to see available commands");
    return Ok(ExitCode::SUCCESS);
  };

  let config = engine_config(&cli.settings)?;
  let operation = build_operation(command)?;

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { execute(config, operation).await })
}

async fn execute(config: EngineConfig, operation: EngineOperation) -> Result<ExitCode> {
  let runner =
    SandboxEngineRunner::from_config(&config).context("failed to start the engine runner")?;

  let operation_type = operation.operation_type();
  let response = runner
    .execute(operation)
    .await
    .with_context(|| format!("{} failed", operation_type))?;

  println!("{}", serde_json::to_string_pretty(&response)?);

  runner.pool().shutdown();
  Ok(match response.status {
    EngineResponseStatus::Ok => ExitCode::SUCCESS,
    _ => ExitCode::FAILURE,
  })
}

/// Resolve settings the same way the engine does, with flags taking the
/// place of their variables.
fn engine_config(settings: &Settings) -> Result<EngineConfig> {
  let mut overrides: HashMap<&str, String> = HashMap::new();
  let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

  let flags = [
    ("FLOWBOX_DATA_DIR", path(&settings.data_dir)),
    ("FLOWBOX_CATALOG_DIR", path(&settings.catalog_dir)),
    ("FLOWBOX_SANDBOX_DIR", path(&settings.sandbox_dir)),
    ("FLOWBOX_MEMORY_LIMIT_KB", settings.memory_limit_kb.map(|v| v.to_string())),
    ("FLOWBOX_CONCURRENCY", settings.concurrency.map(|v| v.to_string())),
    ("FLOWBOX_TASK_TIMEOUT_SECS", settings.timeout_secs.map(|v| v.to_string())),
    ("FLOWBOX_HOST_RELEASE", settings.host_release.clone()),
  ];
  for (name, value) in flags {
    if let Some(value) = value {
      overrides.insert(name, value);
    }
  }

  EngineConfig::from_lookup(|name| {
    overrides
      .get(name)
      .cloned()
      .or_else(|| std::env::var(name).ok())
  })
  .context("invalid engine configuration")
}

fn build_operation(command: Commands) -> Result<EngineOperation> {
  let operation = match command {
    Commands::Run { target } => match target {
      RunTarget::Flow { flow_file } => EngineOperation::ExecuteFlow(ExecuteFlowOperation {
        project_id: String::new(),
        flow_version: read_flow(&flow_file)?,
        trigger_payload: read_payload_from_stdin()?,
      }),
      RunTarget::Step { flow_file, step } => {
        let sample_data = match read_payload_from_stdin()? {
          serde_json::Value::Object(map) => map,
          _ => anyhow::bail!("sample data on stdin must be a JSON object"),
        };
        EngineOperation::ExecuteStep(ExecuteStepOperation {
          project_id: String::new(),
          flow_version: read_flow(&flow_file)?,
          step_name: step,
          sample_data,
        })
      }
    },

    Commands::Trigger {
      flow_file,
      hook,
      webhook_url,
    } => EngineOperation::ExecuteTriggerHook(ExecuteTriggerOperation {
      project_id: String::new(),
      flow_version: read_flow(&flow_file)?,
      hook_type: hook.into(),
      trigger_payload: Some(read_payload_from_stdin()?),
      webhook_url,
    }),

    Commands::Piece { command } => match command {
      PieceCommand::Metadata { name, range } => {
        EngineOperation::ExtractPieceMetadata(ExtractPieceMetadataOperation {
          piece: PiecePackage::new(name, range),
        })
      }
      PieceCommand::ValidateAuth { name, range, auth } => {
        EngineOperation::ExecuteValidateAuth(ExecuteValidateAuthOperation {
          project_id: String::new(),
          piece: PiecePackage::new(name, range),
          auth: parse_auth(&auth),
        })
      }
      PieceCommand::Prop {
        name,
        range,
        target,
        prop,
        inputs,
        auth,
      } => EngineOperation::ExecuteProperty(ExecutePropertyOperation {
        project_id: String::new(),
        piece: PiecePackage::new(name, range),
        action_or_trigger_name: target,
        property_name: prop,
        input: inputs.into_iter().collect(),
        auth: auth.as_deref().map(parse_auth),
      }),
    },

    Commands::Exec { operation_file } => {
      let content = std::fs::read_to_string(&operation_file).with_context(|| {
        format!(
          "failed to read operation file: {}",
          operation_file.display()
        )
      })?;
      serde_json::from_str(&content).with_context(|| {
        format!(
          "failed to parse operation file: {}",
          operation_file.display()
        )
      })?
    }
  };
  Ok(operation)
}

fn read_flow(flow_file: &Path) -> Result<FlowVersion> {
  let content = std::fs::read_to_string(flow_file)
    .with_context(|| format!("failed to read flow file: {}", flow_file.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse flow file: {}", flow_file.display()))
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_auth(auth: &str) -> serde_json::Value {
  serde_json::from_str(auth).unwrap_or_else(|_| serde_json::Value::String(auth.to_string()))
}

fn parse_key_value(arg: &str) -> Result<(String, String), String> {
  arg
    .split_once('=')
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .ok_or_else(|| format!("expected key=value, got '{}'", arg))
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read payload from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
  }
}
