use std::fmt::Write;

use anyhow::Context;
use indexmap::IndexMap;

use super::{DockerHost, escape, is_not_found};

/// Container health as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
  Healthy,
  Unhealthy,
  Starting,
  /// No health check configured, or the runtime reported nothing.
  Unknown,
}

impl HealthStatus {
  fn parse(raw: &str) -> HealthStatus {
    match raw.trim() {
      "healthy" => HealthStatus::Healthy,
      "unhealthy" => HealthStatus::Unhealthy,
      "starting" => HealthStatus::Starting,
      _ => HealthStatus::Unknown,
    }
  }
}

/// Everything needed to start one replica container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
  pub name: String,
  pub image: String,
  pub restart: String,
  pub network: Option<String>,
  pub aliases: Vec<String>,
  /// (host, container). Only mapped for non-public services.
  pub port_map: Option<(u16, u16)>,
  /// Merged environment, REPLICA_NUM included.
  pub env: IndexMap<String, String>,
  /// Remote path of the transient secret env-file.
  pub env_file: Option<String>,
  /// Already-scoped `source:destination[:options]` strings.
  pub volumes: Vec<String>,
  /// Opaque reverse-proxy label block. Present iff public.
  pub labels: Vec<String>,
  /// (port, path) probed by the container health check.
  pub health_probe: Option<(u16, String)>,
}

/// Builds the full `docker run` invocation for a replica.
pub fn run_command(spec: &RunSpec) -> String {
  let mut command = format!("docker run -d --name {}", spec.name);
  if !spec.restart.is_empty() {
    write!(command, " --restart {}", spec.restart).ok();
  }
  if let Some(network) = &spec.network {
    write!(command, " --network {network}").ok();
    for alias in &spec.aliases {
      write!(command, " --network-alias {alias}").ok();
    }
  }
  if let Some((host, container)) = spec.port_map {
    write!(command, " -p {host}:{container}").ok();
  }
  if let Some(env_file) = &spec.env_file {
    write!(command, " --env-file {}", escape(env_file)).ok();
  }
  for (variable, value) in &spec.env {
    write!(command, " -e {}", escape(&format!("{variable}={value}")))
      .ok();
  }
  for volume in &spec.volumes {
    write!(command, " -v {}", escape(volume)).ok();
  }
  for label in &spec.labels {
    write!(command, " --label {}", escape(label)).ok();
  }
  if let Some((port, path)) = &spec.health_probe {
    write!(
      command,
      " --health-cmd {} --health-interval 1s --health-retries 3",
      escape(&format!(
        "curl -fsS http://localhost:{port}{path} || exit 1"
      ))
    )
    .ok();
  }
  write!(command, " {}", spec.image).ok();
  command
}

impl DockerHost {
  pub async fn container_exists(
    &self,
    name: &str,
  ) -> anyhow::Result<bool> {
    let output = self
      .exec(format!(
        "docker container inspect --format '{{{{.Name}}}}' {name}"
      ))
      .await?;
    if output.success() {
      Ok(true)
    } else if is_not_found(&output) {
      Ok(false)
    } else {
      Err(anyhow::anyhow!("{}", output.stderr.trim())).context(
        format!("Failed to inspect container {name} on {}", self.name()),
      )
    }
  }

  pub async fn container_running(
    &self,
    name: &str,
  ) -> anyhow::Result<bool> {
    let output = self
      .exec(format!(
        "docker container inspect --format '{{{{.State.Running}}}}' {name}"
      ))
      .await?;
    if output.success() {
      Ok(output.stdout_trimmed() == "true")
    } else {
      Ok(false)
    }
  }

  /// Health as the runtime sees it. Unknown when the container has
  /// no health check or does not exist.
  pub async fn container_health(
    &self,
    name: &str,
  ) -> anyhow::Result<HealthStatus> {
    let output = self
      .exec(format!(
        "docker container inspect --format '{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{end}}}}' {name}"
      ))
      .await?;
    if output.success() {
      Ok(HealthStatus::parse(&output.stdout))
    } else {
      Ok(HealthStatus::Unknown)
    }
  }

  /// (container id, image id, image reference), if the container exists.
  pub async fn container_brief(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<(String, String, String)>> {
    let output = self
      .exec(format!(
        "docker container inspect --format '{{{{.Id}}}} {{{{.Image}}}} {{{{.Config.Image}}}}' {name}"
      ))
      .await?;
    if !output.success() {
      return Ok(None);
    }
    let stdout = output.stdout_trimmed();
    let mut fields = stdout.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
      (Some(id), Some(image_id), Some(image)) => Ok(Some((
        id.to_string(),
        image_id.to_string(),
        image.to_string(),
      ))),
      _ => Ok(None),
    }
  }

  pub async fn rename_container(
    &self,
    from: &str,
    to: &str,
  ) -> anyhow::Result<()> {
    self
      .exec_check(format!("docker rename {from} {to}"))
      .await?;
    Ok(())
  }

  /// Graceful stop: termination signal, then kill after the grace
  /// period. Missing containers are a no-op.
  pub async fn stop_container(
    &self,
    name: &str,
    grace_seconds: i64,
  ) -> anyhow::Result<()> {
    let output = self
      .exec(super::stop_container_command(
        name,
        Some("SIGTERM"),
        Some(grace_seconds),
      ))
      .await?;
    if output.success() || is_not_found(&output) {
      Ok(())
    } else {
      Err(anyhow::anyhow!("{}", output.stderr.trim()))
        .context(format!("Failed to stop container {name}"))
    }
  }

  /// Force remove. Missing containers are a no-op.
  pub async fn remove_container(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    let output =
      self.exec(format!("docker rm -f {name}")).await?;
    if output.success() || is_not_found(&output) {
      Ok(())
    } else {
      Err(anyhow::anyhow!("{}", output.stderr.trim()))
        .context(format!("Failed to remove container {name}"))
    }
  }

  /// Last `tail` log lines, stdout and stderr interleaved.
  pub async fn container_logs_tail(
    &self,
    name: &str,
    tail: usize,
  ) -> anyhow::Result<String> {
    let output = self
      .exec(format!("docker logs --tail {tail} {name} 2>&1"))
      .await?;
    Ok(output.stdout)
  }

  /// All container names (running or not) starting with `prefix`.
  pub async fn list_containers_by_prefix(
    &self,
    prefix: &str,
  ) -> anyhow::Result<Vec<String>> {
    let output = self
      .exec("docker ps -a --format '{{.Names}}'")
      .await?;
    if !output.success() {
      return Err(anyhow::anyhow!("{}", output.stderr.trim()))
        .context("Failed to list containers");
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

  pub async fn run_container(
    &self,
    spec: &RunSpec,
  ) -> anyhow::Result<()> {
    self.exec_check(run_command(spec)).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn run_command_composition() {
    let spec = RunSpec {
      name: String::from("demo_prod_api_2"),
      image: String::from("nginx:1.25"),
      restart: String::from("unless-stopped"),
      network: Some(String::from("tako_demo_prod")),
      aliases: vec![
        String::from("api"),
        String::from("api_2"),
      ],
      port_map: Some((81, 80)),
      env: IndexMap::from([(
        String::from("REPLICA_NUM"),
        String::from("2"),
      )]),
      env_file: None,
      volumes: vec![String::from("demo_prod_data:/var/data")],
      labels: vec![],
      health_probe: None,
    };
    let command = run_command(&spec);
    assert!(command.starts_with(
      "docker run -d --name demo_prod_api_2 --restart unless-stopped"
    ));
    assert!(command.contains("--network tako_demo_prod"));
    assert!(command.contains("--network-alias api"));
    assert!(command.contains("--network-alias api_2"));
    assert!(command.contains("-p 81:80"));
    assert!(command.contains("REPLICA_NUM=2"));
    assert!(command.contains("-v demo_prod_data:/var/data"));
    assert!(command.ends_with(" nginx:1.25"));
  }

  #[test]
  fn public_services_map_no_ports() {
    let spec = RunSpec {
      name: String::from("demo_prod_web_1"),
      image: String::from("demo-web:latest"),
      labels: vec![String::from("traefik.enable=true")],
      ..Default::default()
    };
    let command = run_command(&spec);
    assert!(!command.contains(" -p "));
    assert!(command.contains("--label traefik.enable=true"));
  }

  #[test]
  fn health_probe_renders_curl_command() {
    let spec = RunSpec {
      name: String::from("demo_prod_api_1"),
      image: String::from("nginx:1.26"),
      health_probe: Some((80, String::from("/"))),
      ..Default::default()
    };
    let command = run_command(&spec);
    assert!(command.contains("--health-cmd"));
    assert!(command.contains("http://localhost:80/"));
  }

  #[test]
  fn health_status_parse() {
    assert_eq!(
      HealthStatus::parse("healthy\n"),
      HealthStatus::Healthy
    );
    assert_eq!(
      HealthStatus::parse("starting"),
      HealthStatus::Starting
    );
    assert_eq!(HealthStatus::parse(""), HealthStatus::Unknown);
  }
}
