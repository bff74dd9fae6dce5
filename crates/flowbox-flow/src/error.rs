use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
  #[error("step not found: {0}")]
  StepNotFound(String),

  #[error("step '{step_name}' is not a {expected} step")]
  UnexpectedStepKind {
    step_name: String,
    expected: &'static str,
  },

  #[error("invalid dependency manifest for '{artifact}': {source}")]
  InvalidManifest {
    artifact: String,
    #[source]
    source: serde_json::Error,
  },
}
