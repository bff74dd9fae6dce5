//! Result normalization.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::task::{EngineResponseStatus, UnitOutcome};

/// Raw outcome of one task plus its wall-clock time.
#[derive(Debug, Clone)]
pub struct RawEngineResult {
  pub time_in_seconds: f64,
  pub verdict: EngineResponseStatus,
  pub output: Option<serde_json::Value>,
  pub standard_output: String,
  pub standard_error: String,
}

impl RawEngineResult {
  pub fn from_outcome(outcome: UnitOutcome, time_in_seconds: f64) -> Self {
    Self {
      time_in_seconds,
      verdict: outcome.status,
      output: outcome.response,
      standard_output: outcome.stdout,
      standard_error: outcome.stderr,
    }
  }
}

/// Typed response returned to callers of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHelperResponse<T> {
  pub status: EngineResponseStatus,
  pub result: Option<T>,
  pub standard_output: String,
  pub standard_error: String,
  pub time_in_seconds: f64,
}

/// Map a raw result to a typed response.
///
/// Non-OK verdicts carry no result and keep stderr as is. An OK verdict whose
/// output does not decode into `T` becomes `INTERNAL_ERROR` with the decode
/// error appended to stderr.
pub fn read_results<T: DeserializeOwned>(raw: RawEngineResult) -> EngineHelperResponse<T> {
  let RawEngineResult {
    time_in_seconds,
    verdict,
    output,
    standard_output,
    mut standard_error,
  } = raw;

  if verdict != EngineResponseStatus::Ok {
    return EngineHelperResponse {
      status: verdict,
      result: None,
      standard_output,
      standard_error,
      time_in_seconds,
    };
  }

  let output = output.unwrap_or(serde_json::Value::Null);
  match serde_json::from_value::<T>(output) {
    Ok(result) => EngineHelperResponse {
      status: EngineResponseStatus::Ok,
      result: Some(result),
      standard_output,
      standard_error,
      time_in_seconds,
    },
    Err(e) => {
      if !standard_error.is_empty() && !standard_error.ends_with('\n') {
        standard_error.push('\n');
      }
      standard_error.push_str(&format!("failed to decode engine response: {}", e));
      EngineHelperResponse {
        status: EngineResponseStatus::InternalError,
        result: None,
        standard_output,
        standard_error,
        time_in_seconds,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[derive(Debug, Deserialize, PartialEq)]
  struct Sample {
    value: i64,
  }

  fn raw(verdict: EngineResponseStatus, output: Option<serde_json::Value>) -> RawEngineResult {
    RawEngineResult {
      time_in_seconds: 0.25,
      verdict,
      output,
      standard_output: "out".to_string(),
      standard_error: "err".to_string(),
    }
  }

  #[test]
  fn test_ok_verdict_decodes_result() {
    let response: EngineHelperResponse<Sample> =
      read_results(raw(EngineResponseStatus::Ok, Some(json!({ "value": 2 }))));

    assert_eq!(response.status, EngineResponseStatus::Ok);
    assert_eq!(response.result, Some(Sample { value: 2 }));
    assert_eq!(response.standard_output, "out");
    assert_eq!(response.time_in_seconds, 0.25);
  }

  #[test]
  fn test_non_ok_verdict_drops_result_and_keeps_stderr() {
    for verdict in [
      EngineResponseStatus::InternalError,
      EngineResponseStatus::MemoryLimitExceeded,
      EngineResponseStatus::Timeout,
    ] {
      let response: EngineHelperResponse<Sample> =
        read_results(raw(verdict, Some(json!({ "value": 2 }))));
      assert_eq!(response.status, verdict);
      assert_eq!(response.result, None);
      assert_eq!(response.standard_error, "err");
    }
  }

  #[test]
  fn test_undecodable_output_becomes_internal_error() {
    let response: EngineHelperResponse<Sample> =
      read_results(raw(EngineResponseStatus::Ok, Some(json!("not a sample"))));

    assert_eq!(response.status, EngineResponseStatus::InternalError);
    assert_eq!(response.result, None);
    assert!(response.standard_error.starts_with("err\n"));
    assert!(response.standard_error.contains("failed to decode engine response"));
  }

  #[test]
  fn test_missing_output_decodes_as_null() {
    let response: EngineHelperResponse<serde_json::Value> =
      read_results(raw(EngineResponseStatus::Ok, None));
    assert_eq!(response.status, EngineResponseStatus::Ok);
    assert_eq!(response.result, Some(serde_json::Value::Null));
  }
}
