use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use flowbox_sandbox::SandboxLayout;
use flowbox_worker::{WorkerPoolConfig, unit_environment};

use crate::error::EngineError;

/// Pieces source reported to execution units when none is configured.
pub const DEFAULT_PIECES_SOURCE: &str = "FILE";

/// Configuration for a [`SandboxEngineRunner`](crate::SandboxEngineRunner).
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Directory holding the sandbox and the local catalog by default.
  pub data_dir: PathBuf,

  /// Shared sandbox directory.
  pub sandbox_root: PathBuf,

  /// Root of the filesystem piece catalog.
  pub catalog_root: PathBuf,

  /// Where pieces come from, passed through to execution units.
  pub pieces_source: String,

  /// Release of this host. Pieces declaring a window that excludes it are
  /// rejected. `None` accepts every piece.
  pub host_release: Option<String>,

  /// Memory budget per execution unit in KB.
  pub memory_limit_kb: u64,

  pub concurrency: usize,
  pub concurrency_floor: usize,

  /// Names of host environment variables execution units may read.
  pub allowed_env: Vec<String>,

  pub task_timeout: Duration,
  pub grace_period: Duration,

  /// Ask execution units for extra diagnostics.
  pub diagnostics: bool,
}

impl EngineConfig {
  /// Defaults with everything stored under `data_dir`.
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    let data_dir = data_dir.into();
    let worker = WorkerPoolConfig::new(data_dir.join("sandbox"));
    Self {
      sandbox_root: worker.sandbox_root,
      catalog_root: data_dir.join("pieces"),
      data_dir,
      pieces_source: DEFAULT_PIECES_SOURCE.to_string(),
      host_release: None,
      memory_limit_kb: worker.memory_limit_kb,
      concurrency: worker.concurrency,
      concurrency_floor: worker.concurrency_floor,
      allowed_env: Vec::new(),
      task_timeout: worker.task_timeout,
      grace_period: worker.grace_period,
      diagnostics: false,
    }
  }

  /// `~/.flowbox`
  pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".flowbox"))
  }

  /// Read `FLOWBOX_*` variables from the process environment.
  pub fn from_env() -> Result<Self, EngineError> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Build a config from `lookup`, falling back to defaults for unset or
  /// blank variables.
  ///
  /// | Variable | Field |
  /// |---|---|
  /// | `FLOWBOX_DATA_DIR` | `data_dir` (default `~/.flowbox`) |
  /// | `FLOWBOX_SANDBOX_DIR` | `sandbox_root` |
  /// | `FLOWBOX_CATALOG_DIR` | `catalog_root` |
  /// | `FLOWBOX_PIECES_SOURCE` | `pieces_source` |
  /// | `FLOWBOX_HOST_RELEASE` | `host_release` |
  /// | `FLOWBOX_MEMORY_LIMIT_KB` | `memory_limit_kb` |
  /// | `FLOWBOX_CONCURRENCY` | `concurrency` |
  /// | `FLOWBOX_CONCURRENCY_FLOOR` | `concurrency_floor` |
  /// | `FLOWBOX_ALLOWED_ENV` | `allowed_env`, comma separated |
  /// | `FLOWBOX_TASK_TIMEOUT_SECS` | `task_timeout` |
  /// | `FLOWBOX_DIAGNOSTICS` | `diagnostics` |
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
    let var = |name: &str| {
      lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    };

    let data_dir = match var("FLOWBOX_DATA_DIR") {
      Some(dir) => PathBuf::from(dir),
      None => Self::default_data_dir().ok_or(EngineError::NoDataDir)?,
    };
    let mut config = Self::new(data_dir);

    if let Some(dir) = var("FLOWBOX_SANDBOX_DIR") {
      config.sandbox_root = PathBuf::from(dir);
    }
    if let Some(dir) = var("FLOWBOX_CATALOG_DIR") {
      config.catalog_root = PathBuf::from(dir);
    }
    if let Some(source) = var("FLOWBOX_PIECES_SOURCE") {
      config.pieces_source = source;
    }
    config.host_release = var("FLOWBOX_HOST_RELEASE");

    if let Some(kb) = parse(&var, "FLOWBOX_MEMORY_LIMIT_KB")? {
      config.memory_limit_kb = kb;
    }
    if let Some(n) = parse(&var, "FLOWBOX_CONCURRENCY")? {
      config.concurrency = n;
    }
    if let Some(n) = parse(&var, "FLOWBOX_CONCURRENCY_FLOOR")? {
      config.concurrency_floor = n;
    }
    if let Some(secs) = parse(&var, "FLOWBOX_TASK_TIMEOUT_SECS")? {
      config.task_timeout = Duration::from_secs(secs);
    }
    if let Some(names) = var("FLOWBOX_ALLOWED_ENV") {
      config.allowed_env = names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    }
    if let Some(flag) = var("FLOWBOX_DIAGNOSTICS") {
      config.diagnostics = parse_flag("FLOWBOX_DIAGNOSTICS", &flag)?;
    }

    Ok(config)
  }

  /// Pool settings, with the unit environment built from the current process.
  pub fn worker_config(&self) -> WorkerPoolConfig {
    self.worker_config_with(|name| std::env::var(name).ok())
  }

  pub(crate) fn worker_config_with(
    &self,
    lookup: impl Fn(&str) -> Option<String>,
  ) -> WorkerPoolConfig {
    let mut worker = WorkerPoolConfig::new(&self.sandbox_root);
    worker.memory_limit_kb = self.memory_limit_kb;
    worker.concurrency = self.concurrency;
    worker.concurrency_floor = self.concurrency_floor;
    worker.task_timeout = self.task_timeout;
    worker.grace_period = self.grace_period;
    worker.env = unit_environment(
      &self.allowed_env,
      lookup,
      &SandboxLayout::new(&self.sandbox_root),
      &self.pieces_source,
      self.diagnostics,
    );
    worker
  }
}

fn parse<T: FromStr>(
  var: &impl Fn(&str) -> Option<String>,
  name: &str,
) -> Result<Option<T>, EngineError> {
  var(name)
    .map(|value| {
      value.parse::<T>().map_err(|_| EngineError::InvalidConfig {
        name: name.to_string(),
        value,
      })
    })
    .transpose()
}

fn parse_flag(name: &str, value: &str) -> Result<bool, EngineError> {
  match value.to_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(EngineError::InvalidConfig {
      name: name.to_string(),
      value: value.to_string(),
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name| vars.get(name).cloned()
  }

  #[test]
  fn test_defaults_live_under_data_dir() {
    let config = EngineConfig::from_lookup(lookup(&[("FLOWBOX_DATA_DIR", "/srv/flowbox")])).unwrap();

    assert_eq!(config.sandbox_root, PathBuf::from("/srv/flowbox/sandbox"));
    assert_eq!(config.catalog_root, PathBuf::from("/srv/flowbox/pieces"));
    assert_eq!(config.pieces_source, "FILE");
    assert_eq!(config.memory_limit_kb, 524_288);
    assert_eq!(config.task_timeout, Duration::from_secs(600));
    assert_eq!(config.host_release, None);
    assert!(!config.diagnostics);
  }

  #[test]
  fn test_variables_override_defaults() {
    let config = EngineConfig::from_lookup(lookup(&[
      ("FLOWBOX_DATA_DIR", "/srv/flowbox"),
      ("FLOWBOX_CATALOG_DIR", "/opt/pieces"),
      ("FLOWBOX_HOST_RELEASE", "0.30.0"),
      ("FLOWBOX_MEMORY_LIMIT_KB", "1024"),
      ("FLOWBOX_CONCURRENCY", "3"),
      ("FLOWBOX_ALLOWED_ENV", "API_BASE, REGION,,"),
      ("FLOWBOX_TASK_TIMEOUT_SECS", "30"),
      ("FLOWBOX_DIAGNOSTICS", "yes"),
      ("FLOWBOX_CONCURRENCY_FLOOR", "  "),
    ]))
    .unwrap();

    assert_eq!(config.catalog_root, PathBuf::from("/opt/pieces"));
    assert_eq!(config.host_release.as_deref(), Some("0.30.0"));
    assert_eq!(config.memory_limit_kb, 1024);
    assert_eq!(config.concurrency, 3);
    assert_eq!(config.concurrency_floor, 5);
    assert_eq!(config.allowed_env, vec!["API_BASE", "REGION"]);
    assert_eq!(config.task_timeout, Duration::from_secs(30));
    assert!(config.diagnostics);
  }

  #[test]
  fn test_invalid_number_is_rejected() {
    let err = EngineConfig::from_lookup(lookup(&[
      ("FLOWBOX_DATA_DIR", "/srv/flowbox"),
      ("FLOWBOX_MEMORY_LIMIT_KB", "lots"),
    ]))
    .unwrap_err();

    match err {
      EngineError::InvalidConfig { name, value } => {
        assert_eq!(name, "FLOWBOX_MEMORY_LIMIT_KB");
        assert_eq!(value, "lots");
      }
      other => panic!("unexpected error: {:?}", other),
    }
  }

  #[test]
  fn test_worker_config_exposes_only_allowed_env() {
    let mut config = EngineConfig::new("/srv/flowbox");
    config.allowed_env = vec!["API_BASE".to_string()];
    config.memory_limit_kb = 2048;

    let worker = config.worker_config_with(lookup(&[
      ("API_BASE", "https://api.example.test"),
      ("AWS_SECRET_ACCESS_KEY", "hunter2"),
    ]));

    assert_eq!(worker.memory_limit_kb, 2048);
    assert_eq!(worker.sandbox_root, PathBuf::from("/srv/flowbox/sandbox"));
    assert_eq!(
      worker.env.get("API_BASE").map(String::as_str),
      Some("https://api.example.test")
    );
    assert!(!worker.env.contains_key("AWS_SECRET_ACCESS_KEY"));
    assert_eq!(
      worker.env.get("FLOWBOX_BASE_CODE_DIRECTORY").map(String::as_str),
      Some("/srv/flowbox/sandbox/codes")
    );
  }
}
