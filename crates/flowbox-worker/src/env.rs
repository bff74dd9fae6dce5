use std::collections::BTreeMap;

use flowbox_sandbox::SandboxLayout;

/// Directory holding compiled code artifacts.
pub const BASE_CODE_DIRECTORY_VAR: &str = "FLOWBOX_BASE_CODE_DIRECTORY";

/// Where pieces are installed from.
pub const PIECES_SOURCE_VAR: &str = "FLOWBOX_PIECES_SOURCE";

/// Set to "true" when units should emit extra diagnostics.
pub const DIAGNOSTICS_VAR: &str = "FLOWBOX_DIAGNOSTICS";

/// Build the environment exposed to execution units.
///
/// Only the `allowed` host variables are copied, using `lookup` to read them;
/// unset ones are skipped. The fixed runtime variables are added last and win
/// over host values of the same name.
pub fn unit_environment(
  allowed: &[String],
  lookup: impl Fn(&str) -> Option<String>,
  layout: &SandboxLayout,
  pieces_source: &str,
  diagnostics: bool,
) -> BTreeMap<String, String> {
  let mut env: BTreeMap<String, String> = allowed
    .iter()
    .filter_map(|name| lookup(name).map(|value| (name.clone(), value)))
    .collect();

  env.insert(
    BASE_CODE_DIRECTORY_VAR.to_string(),
    layout.codes_dir().display().to_string(),
  );
  env.insert(PIECES_SOURCE_VAR.to_string(), pieces_source.to_string());
  env.insert(DIAGNOSTICS_VAR.to_string(), diagnostics.to_string());
  env
}
