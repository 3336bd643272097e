use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(
  Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct EnvVar {
  pub variable: String,
  pub value: String,
}

/// Parses dotenv-style contents. Blank lines and `#` comment lines
/// are skipped. Values keep everything after the first `=`, with
/// one layer of surrounding quotes removed.
pub fn parse_env_contents(contents: &str) -> Vec<EnvVar> {
  contents
    .lines()
    .filter_map(|line| {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        return None;
      }
      let (variable, value) = line.split_once('=')?;
      let value = value.trim();
      let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| {
          value.strip_prefix('\'').and_then(|v| v.strip_suffix('\''))
        })
        .unwrap_or(value);
      Some(EnvVar {
        variable: variable.trim().to_string(),
        value: value.to_string(),
      })
    })
    .collect()
}

pub async fn read_env_file(
  path: impl AsRef<Path>,
) -> anyhow::Result<Vec<EnvVar>> {
  let path = path.as_ref();
  let contents = tokio::fs::read_to_string(path)
    .await
    .with_context(|| {
      format!("Failed to read env file at {}", path.display())
    })?;
  Ok(parse_env_contents(&contents))
}

/// Merges env file variables under the explicit map.
/// An explicit variable always wins over the file's.
pub fn merge_env(
  file_env: &[EnvVar],
  explicit: &IndexMap<String, String>,
) -> IndexMap<String, String> {
  let mut merged = IndexMap::with_capacity(
    file_env.len() + explicit.len(),
  );
  for EnvVar { variable, value } in file_env {
    merged.insert(variable.clone(), value.clone());
  }
  for (variable, value) in explicit {
    merged.insert(variable.clone(), value.clone());
  }
  merged
}

/// Renders a merged environment back into file contents
/// suitable for upload as a container env-file.
pub fn format_env_contents(
  env: &IndexMap<String, String>,
) -> String {
  env
    .iter()
    .map(|(variable, value)| format!("{variable}={value}"))
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_skips_blank_and_comment_lines() {
    let env = parse_env_contents(
      "# comment\n\nFOO=bar\nBAZ=qux=extra\n  \n#X=1",
    );
    assert_eq!(env.len(), 2);
    assert_eq!(env[0].variable, "FOO");
    assert_eq!(env[0].value, "bar");
    assert_eq!(env[1].variable, "BAZ");
    assert_eq!(env[1].value, "qux=extra");
  }

  #[test]
  fn parse_strips_matched_quotes() {
    let env =
      parse_env_contents("A=\"quoted\"\nB='single'\nC=\"half");
    assert_eq!(env[0].value, "quoted");
    assert_eq!(env[1].value, "single");
    assert_eq!(env[2].value, "\"half");
  }

  #[test]
  fn explicit_wins_over_file() {
    let file = parse_env_contents("PORT=3000\nHOST=internal");
    let explicit = IndexMap::from([(
      String::from("PORT"),
      String::from("8080"),
    )]);
    let merged = merge_env(&file, &explicit);
    assert_eq!(merged["PORT"], "8080");
    assert_eq!(merged["HOST"], "internal");
  }

  #[test]
  fn format_round_trips_pairs() {
    let merged = IndexMap::from([
      (String::from("A"), String::from("1")),
      (String::from("B"), String::from("2")),
    ]);
    assert_eq!(format_env_contents(&merged), "A=1\nB=2");
  }
}
