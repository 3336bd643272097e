use std::sync::Arc;

use anyhow::{Context, anyhow};
use config::Server;
use ssh::{SshClient, SshOutput};

mod containers;
mod images;
mod networks;
mod nodes;
mod services;

pub use containers::{HealthStatus, RunSpec};
pub use services::{ServiceSpec, ServiceUpdate};

/// Container runtime verbs for one host, issued through the SSH
/// transport. Verbs treat "not found" as a normal return, never an
/// error: absence means different things to different callers.
#[derive(Clone)]
pub struct DockerHost {
  pub client: Arc<SshClient>,
  pub server: Server,
}

impl DockerHost {
  pub fn new(client: Arc<SshClient>, server: Server) -> DockerHost {
    DockerHost { client, server }
  }

  pub fn name(&self) -> &str {
    &self.server.name
  }

  /// Runs a command, surfacing only transport errors. Callers
  /// inspect the output's exit status themselves.
  pub async fn exec(
    &self,
    command: impl AsRef<str>,
  ) -> anyhow::Result<SshOutput> {
    let command = command.as_ref();
    self.client.execute(command).await.with_context(|| {
      format!(
        "Transport failure on {} ({}) running `{command}`",
        self.server.name, self.server.host
      )
    })
  }

  /// Runs a command and errors on non-zero exit, with the host and
  /// the command's stderr attached.
  pub async fn exec_check(
    &self,
    command: impl AsRef<str>,
  ) -> anyhow::Result<SshOutput> {
    let command = command.as_ref();
    let output = self.exec(command).await?;
    if output.success() {
      Ok(output)
    } else {
      Err(
        anyhow!("{}", output.stderr.trim()).context(format!(
          "`{command}` failed on {} ({})",
          self.server.name, self.server.host
        )),
      )
    }
  }
}

/// The runtime reports missing containers / images / networks /
/// services with one of these markers on stderr.
pub fn is_not_found(output: &SshOutput) -> bool {
  let stderr = output.stderr.to_lowercase();
  stderr.contains("no such")
    || stderr.contains("not found")
    || stderr.contains("no container")
}

pub fn stop_container_command(
  container_name: &str,
  signal: Option<&str>,
  time: Option<i64>,
) -> String {
  let signal = signal
    .map(|signal| format!(" --signal {signal}"))
    .unwrap_or_default();
  let time = time
    .map(|time| format!(" --time {time}"))
    .unwrap_or_default();
  format!("docker stop{signal}{time} {container_name}")
}

pub fn escape(value: &str) -> String {
  shell_escape::escape(value.into()).into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stop_command_includes_signal_and_time() {
    assert_eq!(
      stop_container_command("demo_prod_api_1", None, None),
      "docker stop demo_prod_api_1"
    );
    assert_eq!(
      stop_container_command(
        "demo_prod_api_1",
        Some("SIGTERM"),
        Some(30)
      ),
      "docker stop --signal SIGTERM --time 30 demo_prod_api_1"
    );
  }

  #[test]
  fn not_found_markers() {
    let output = SshOutput {
      stderr: String::from(
        "Error: No such container: demo_prod_api_1",
      ),
      exit_status: Some(1),
      ..Default::default()
    };
    assert!(is_not_found(&output));
    let output = SshOutput {
      stderr: String::from("permission denied"),
      exit_status: Some(1),
      ..Default::default()
    };
    assert!(!is_not_found(&output));
  }
}
