use anyhow::Context;

use super::{DockerHost, escape};

impl DockerHost {
  /// Whether this host is an active member of a cluster.
  pub async fn swarm_active(&self) -> anyhow::Result<bool> {
    let output = self
      .exec(
        "docker info --format '{{.Swarm.LocalNodeState}}'",
      )
      .await?;
    Ok(
      output.success()
        && output.stdout_trimmed() == "active",
    )
  }

  pub async fn swarm_init(
    &self,
    advertise_addr: &str,
  ) -> anyhow::Result<()> {
    self
      .exec_check(format!(
        "docker swarm init --advertise-addr {advertise_addr}"
      ))
      .await
      .with_context(|| {
        format!("Failed to initialize cluster on {}", self.name())
      })?;
    Ok(())
  }

  pub async fn swarm_worker_token(
    &self,
  ) -> anyhow::Result<String> {
    let output = self
      .exec_check("docker swarm join-token -q worker")
      .await
      .context("Failed to obtain worker join token")?;
    Ok(output.stdout_trimmed())
  }

  pub async fn swarm_join(
    &self,
    manager_addr: &str,
    token: &str,
  ) -> anyhow::Result<()> {
    self
      .exec_check(format!(
        "docker swarm join --token {token} {manager_addr}:2377"
      ))
      .await
      .with_context(|| {
        format!("{} failed to join the cluster", self.name())
      })?;
    Ok(())
  }

  pub async fn swarm_leave_force(&self) -> anyhow::Result<()> {
    self.exec("docker swarm leave --force").await?;
    Ok(())
  }

  /// The node id the manager resolves for a given hostname, used to
  /// detect broken memberships. Run against the manager.
  pub async fn node_id_by_hostname(
    &self,
    hostname: &str,
  ) -> anyhow::Result<Option<String>> {
    let output = self
      .exec(
        "docker node ls --format '{{.ID}} {{.Hostname}}'",
      )
      .await?;
    if !output.success() {
      return Ok(None);
    }
    for line in output.stdout.lines() {
      let mut fields = line.split_whitespace();
      if let (Some(id), Some(host)) =
        (fields.next(), fields.next())
        && host == hostname
      {
        return Ok(Some(id.to_string()));
      }
    }
    Ok(None)
  }

  /// This host's own hostname as the runtime reports it.
  pub async fn node_hostname(&self) -> anyhow::Result<String> {
    let output = self
      .exec_check("docker info --format '{{.Name}}'")
      .await
      .context("Failed to read node hostname")?;
    Ok(output.stdout_trimmed())
  }

  /// Applies a label through the manager.
  pub async fn node_label_set(
    &self,
    node_id: &str,
    key: &str,
    value: &str,
  ) -> anyhow::Result<()> {
    self
      .exec_check(format!(
        "docker node update --label-add {} {node_id}",
        escape(&format!("{key}={value}"))
      ))
      .await
      .with_context(|| {
        format!("Failed to label node {node_id} with {key}={value}")
      })?;
    Ok(())
  }
}
