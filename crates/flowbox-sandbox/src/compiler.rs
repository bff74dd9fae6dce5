use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::fs;
use tracing::{info, instrument, warn};

use flowbox_catalog::PieceCatalog;
use flowbox_flow::CodeArtifact;

use crate::error::SandboxError;
use crate::installer::{write_file, write_json, write_package_files};
use crate::layout::{SandboxLayout, sanitize_segment};

/// Result of compiling one code artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
  /// `index.lua` holds the compiled module.
  Compiled,
  /// `index.lua` holds a module that raises `message` when executed.
  Stubbed { message: String },
}

/// Wrap step source into a module that returns the step function.
///
/// The code goes on the first line so that line numbers in errors match the
/// user's source.
pub fn wrap_source(code: &str) -> String {
  format!("return function(inputs) {}\nend\n", code)
}

/// Compiles code artifacts into runnable Lua modules inside the sandbox.
pub struct ArtifactCompiler {
  layout: SandboxLayout,
  catalog: Arc<dyn PieceCatalog>,
}

impl ArtifactCompiler {
  pub fn new(layout: SandboxLayout, catalog: Arc<dyn PieceCatalog>) -> Self {
    Self { layout, catalog }
  }

  /// Compile an artifact to `codes/{flow_version_id}/{name}/index.lua`.
  ///
  /// Dependency and compile failures produce a stub module instead of an
  /// error. Only a failure to write the stub itself is returned as `Err`.
  #[instrument(
    name = "compile_artifact",
    skip(self, artifact),
    fields(artifact = %artifact.key())
  )]
  pub async fn compile(&self, artifact: &CodeArtifact) -> Result<BuildOutcome, SandboxError> {
    let dir = self.layout.artifact_dir(&artifact.key());

    match self.build(artifact, &dir).await {
      Ok(()) => {
        info!(path = %dir.display(), "artifact_compiled");
        Ok(BuildOutcome::Compiled)
      }
      Err(message) => {
        warn!(error = %message, "artifact_stubbed");
        fs::create_dir_all(&dir)
          .await
          .map_err(|e| SandboxError::io(&dir, e))?;
        let message = format!("Compilation Error: {}", message);
        write_file(&dir.join("index.lua"), stub_module(&message).as_bytes()).await?;
        Ok(BuildOutcome::Stubbed { message })
      }
    }
  }

  async fn build(&self, artifact: &CodeArtifact, dir: &Path) -> Result<(), String> {
    // The previous index.lua stays readable until it is replaced, either by
    // the new module or by a stub.
    fs::create_dir_all(dir).await.map_err(|e| e.to_string())?;

    let dependencies = artifact
      .source_code
      .dependencies(&artifact.name)
      .map_err(|e| e.to_string())?;

    write_json(
      &dir.join("manifest.json"),
      &json!({ "dependencies": dependencies }),
      "dependency manifest",
    )
    .await
    .map_err(|e| e.to_string())?;

    self
      .install_dependencies(&self.layout.artifact_modules_dir(&artifact.key()), &dependencies)
      .await
      .map_err(|e| format!("failed to install dependencies: {}", e))?;

    write_file(&dir.join("source.lua"), artifact.source_code.code.as_bytes())
      .await
      .map_err(|e| e.to_string())?;
    write_json(&dir.join("build.json"), &build_config(), "build configuration")
      .await
      .map_err(|e| e.to_string())?;

    let module = wrap_source(&artifact.source_code.code);
    let chunk_name = format!("={}", artifact.name);
    let checked = module.clone();
    tokio::task::spawn_blocking(move || syntax_check(&checked, &chunk_name))
      .await
      .map_err(|e| e.to_string())??;

    write_file(&dir.join("index.lua"), module.as_bytes())
      .await
      .map_err(|e| e.to_string())
  }

  async fn install_dependencies(
    &self,
    modules: &Path,
    dependencies: &BTreeMap<String, String>,
  ) -> Result<(), SandboxError> {
    for (name, range) in dependencies {
      let version = self
        .catalog
        .resolve(name, range)
        .await?
        .ok_or_else(|| SandboxError::Install {
          piece: name.clone(),
          message: format!("no version matches {}", range),
        })?;
      let archive = self.catalog.fetch(name, &version).await?;
      write_package_files(&modules.join(sanitize_segment(name)), &archive.files).await?;
    }
    Ok(())
  }
}

/// Fixed compiler configuration: undeclared globals allowed, no strictness
/// checks.
fn build_config() -> serde_json::Value {
  json!({
    "language": "lua5.4",
    "strict": false,
    "allow_undeclared_globals": true,
    "wrapper": "return function(inputs) ... end",
  })
}

fn syntax_check(module: &str, chunk_name: &str) -> Result<(), String> {
  let lua = mlua::Lua::new();
  lua
    .load(module)
    .set_name(chunk_name)
    .into_function()
    .map(|_| ())
    .map_err(|e| match e {
      mlua::Error::SyntaxError { message, .. } => message,
      other => other.to_string(),
    })
}

/// A module whose only behavior is to raise `message`.
fn stub_module(message: &str) -> String {
  let mut level = 0;
  loop {
    let close = format!("]{}]", "=".repeat(level));
    if !message.contains(&close) {
      break;
    }
    level += 1;
  }
  let eq = "=".repeat(level);
  format!(
    "return function() error([{eq}[{message}]{eq}], 0) end\n",
    eq = eq,
    message = message
  )
}
