use anyhow::anyhow;
use command::{Log, run_tako_command};
use indexmap::IndexMap;

use config::Hooks;

use crate::docker::escape;

/// Checks every declared hook parses as shell before anything runs.
/// A deployment never starts with invalid hooks.
pub async fn validate_hooks(
  service: &str,
  hooks: &Hooks,
) -> anyhow::Result<()> {
  let stages = [
    ("pre-build", &hooks.pre_build),
    ("post-build", &hooks.post_build),
    ("pre-deploy", &hooks.pre_deploy),
    ("post-deploy", &hooks.post_deploy),
    ("post-start", &hooks.post_start),
  ];
  for (stage, snippets) in stages {
    for snippet in snippets {
      let log = run_tako_command(
        "Validate Hooks",
        None,
        format!("bash -n -c {}", escape(snippet)),
      )
      .await;
      if !log.success {
        return Err(anyhow!(
          "invalid {stage} hook on service '{service}': {snippet}\n{}",
          log.stderr.trim()
        ));
      }
    }
  }
  Ok(())
}

/// Runs a hook stage locally, in order, with the merged service
/// environment exported. The first failing hook fails the stage
/// with its output attached.
pub async fn run_hooks(
  stage: &str,
  snippets: &[String],
  env: &IndexMap<String, String>,
) -> anyhow::Result<Vec<Log>> {
  let mut logs = Vec::with_capacity(snippets.len());
  let exports = env_exports(env);
  for snippet in snippets {
    let log = run_tako_command(
      stage,
      None,
      format!("{exports}{snippet}"),
    )
    .await;
    let success = log.success;
    logs.push(log);
    if !success {
      let log = logs.last().unwrap();
      return Err(anyhow!(
        "{stage} hook failed: {snippet}\n{}",
        log.combined()
      ));
    }
  }
  Ok(logs)
}

fn env_exports(env: &IndexMap<String, String>) -> String {
  env
    .iter()
    .map(|(variable, value)| {
      format!("export {variable}={} && ", escape(value))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn valid_hooks_pass_validation() {
    let hooks = Hooks {
      pre_deploy: vec![String::from("echo deploying")],
      ..Default::default()
    };
    validate_hooks("api", &hooks).await.unwrap();
  }

  #[tokio::test]
  async fn unparseable_hook_is_refused() {
    let hooks = Hooks {
      pre_deploy: vec![String::from("if then fi (")],
      ..Default::default()
    };
    assert!(validate_hooks("api", &hooks).await.is_err());
  }

  #[tokio::test]
  async fn hooks_see_the_merged_environment() {
    let env = IndexMap::from([(
      String::from("DEPLOY_TARGET"),
      String::from("prod"),
    )]);
    let logs = run_hooks(
      "pre-deploy",
      &[String::from("test \"$DEPLOY_TARGET\" = prod")],
      &env,
    )
    .await
    .unwrap();
    assert!(logs[0].success);
  }

  #[tokio::test]
  async fn failing_hook_stops_the_stage() {
    let env = IndexMap::new();
    let result = run_hooks(
      "pre-deploy",
      &[
        String::from("false"),
        String::from("echo never-runs"),
      ],
      &env,
    )
    .await;
    assert!(result.is_err());
  }
}
