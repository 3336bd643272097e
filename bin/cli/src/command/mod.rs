use std::sync::Arc;

use anyhow::{Context, anyhow};
use command::run_tako_command;
use config::Environment;
use futures_util::future::try_join_all;
use ssh::{SshClient, SshPool};

use crate::{
  config::{cli_env, connect_params, project_config},
  deploy::{Deployer, NoopVerifier},
  docker::DockerHost,
  journal::{DeploymentRecord, Journal},
};

pub mod deploy;
pub mod history;
pub mod rollback;

/// Connects the whole environment and assembles the deployment
/// context: pooled transports, docker hosts, journal.
pub async fn make_deployer(
  environment_name: String,
  environment: &Environment,
) -> anyhow::Result<Deployer> {
  let pool = SshPool::new();
  let manager_server = environment.manager().clone();
  let manager_client = pool
    .client(connect_params(&manager_server)?)
    .await
    .with_context(|| {
      format!(
        "Failed to connect to manager {} ({})",
        manager_server.name, manager_server.host
      )
    })?;

  let workers: Vec<(Arc<SshClient>, config::Server)> =
    try_join_all(environment.workers().iter().map(
      |server| async {
        let client = pool
          .client(connect_params(server)?)
          .await
          .with_context(|| {
            format!(
              "Failed to connect to worker {} ({})",
              server.name, server.host
            )
          })?;
        anyhow::Ok((client, server.clone()))
      },
    ))
    .await?;

  let project = project_config();
  let journal = Journal {
    project: project.name.clone(),
    manager_host: manager_server.host.clone(),
    manager: manager_client.clone(),
    workers: workers
      .iter()
      .map(|(client, _)| client.clone())
      .collect(),
  };

  Ok(Deployer {
    project,
    environment_name,
    manager: DockerHost::new(manager_client, manager_server),
    workers: workers
      .into_iter()
      .map(|(client, server)| DockerHost::new(client, server))
      .collect(),
    journal,
    state_key: cli_env().tako_state_key.clone(),
    verifier: Box::new(NoopVerifier),
  })
}

/// Interactive confirmation, bypassed with --yes.
pub fn confirm(prompt: &str, yes: bool) -> anyhow::Result<()> {
  if yes {
    return Ok(());
  }
  eprint!("{prompt} (y/n) ");
  let mut line = String::new();
  std::io::stdin()
    .read_line(&mut line)
    .context("Failed to read confirmation")?;
  if matches!(line.trim(), "y" | "Y" | "yes") {
    Ok(())
  } else {
    Err(anyhow!("Aborted by user"))
  }
}

pub fn current_user() -> String {
  std::env::var("USER")
    .or_else(|_| std::env::var("USERNAME"))
    .unwrap_or_else(|_| String::from("unknown"))
}

/// Stamps source-control metadata on the record when the working
/// directory is a git checkout. Best effort.
pub async fn attach_git_metadata(record: &mut DeploymentRecord) {
  let log = run_tako_command(
    "Git Metadata",
    None,
    "git log -1 --pretty=format:'%H%n%h%n%an%n%s' && git rev-parse --abbrev-ref HEAD",
  )
  .await;
  if !log.success {
    return;
  }
  let mut lines = log.stdout.lines();
  record.git_commit = lines.next().map(str::to_string);
  record.git_commit_short = lines.next().map(str::to_string);
  record.git_author = lines.next().map(str::to_string);
  record.git_commit_msg = lines.next().map(str::to_string);
  record.git_branch = lines.next().map(str::to_string);
}
