use anyhow::Context;

use super::DockerHost;

impl DockerHost {
  pub async fn network_exists(
    &self,
    name: &str,
  ) -> anyhow::Result<bool> {
    let output = self
      .exec(format!(
        "docker network inspect --format '{{{{.Id}}}}' {name}"
      ))
      .await?;
    Ok(output.success())
  }

  /// Creates the network when missing. Overlay networks are created
  /// attachable so plain containers can join them.
  pub async fn ensure_network(
    &self,
    name: &str,
    overlay: bool,
  ) -> anyhow::Result<()> {
    if self.network_exists(name).await? {
      return Ok(());
    }
    let driver = if overlay {
      " --driver overlay --attachable"
    } else {
      ""
    };
    self
      .exec_check(format!("docker network create{driver} {name}"))
      .await
      .with_context(|| {
        format!("Failed to create network {name} on {}", self.name())
      })?;
    info!("created network {name} on {}", self.name());
    Ok(())
  }

  /// Attaches a container with the given aliases. Re-attaching an
  /// already-connected container is a no-op.
  pub async fn connect_network(
    &self,
    network: &str,
    container: &str,
    aliases: &[String],
  ) -> anyhow::Result<()> {
    let aliases = aliases
      .iter()
      .map(|alias| format!(" --alias {alias}"))
      .collect::<String>();
    let output = self
      .exec(format!(
        "docker network connect{aliases} {network} {container}"
      ))
      .await?;
    if output.success()
      || output.stderr.contains("already exists in network")
    {
      Ok(())
    } else {
      Err(anyhow::anyhow!("{}", output.stderr.trim())).context(
        format!(
          "Failed to connect {container} to network {network}"
        ),
      )
    }
  }

  /// Every network on the host with the given prefix.
  pub async fn list_networks_by_prefix(
    &self,
    prefix: &str,
  ) -> anyhow::Result<Vec<String>> {
    let output = self
      .exec("docker network ls --format '{{.Name}}'")
      .await?;
    if !output.success() {
      return Err(anyhow::anyhow!("{}", output.stderr.trim()))
        .context("Failed to list networks");
    }
    Ok(
      output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(prefix))
        .map(str::to_string)
        .collect(),
    )
  }
}
