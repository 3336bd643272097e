use std::fmt::Write;

use anyhow::Context;
use indexmap::IndexMap;

use super::{DockerHost, escape, is_not_found};

/// Managed-service definition for cluster mode deploys.
#[derive(Debug, Clone, Default)]
pub struct ServiceSpec {
  pub name: String,
  pub image: String,
  pub replicas: i64,
  pub network: Option<String>,
  pub aliases: Vec<String>,
  pub port_map: Option<(u16, u16)>,
  pub env: IndexMap<String, String>,
  pub labels: Vec<String>,
  /// `node.labels...` placement expression.
  pub constraint: Option<String>,
}

/// Delta applied by `docker service update`.
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
  pub image: Option<String>,
  pub replicas: Option<i64>,
  pub env_add: IndexMap<String, String>,
  pub env_rm: Vec<String>,
}

pub fn service_create_command(spec: &ServiceSpec) -> String {
  let mut command = format!(
    "docker service create -d --name {} --replicas {}",
    spec.name,
    spec.replicas.max(1)
  );
  if let Some(network) = &spec.network {
    let aliases = spec
      .aliases
      .iter()
      .map(|alias| format!(",alias={alias}"))
      .collect::<String>();
    write!(command, " --network name={network}{aliases}").ok();
  }
  if let Some((host, container)) = spec.port_map {
    write!(command, " --publish {host}:{container}").ok();
  }
  for (variable, value) in &spec.env {
    write!(
      command,
      " --env {}",
      escape(&format!("{variable}={value}"))
    )
    .ok();
  }
  for label in &spec.labels {
    write!(command, " --label {}", escape(label)).ok();
  }
  if let Some(constraint) = &spec.constraint {
    write!(command, " --constraint {}", escape(constraint)).ok();
  }
  write!(command, " {}", spec.image).ok();
  command
}

pub fn service_update_command(
  name: &str,
  update: &ServiceUpdate,
) -> String {
  let mut command = String::from("docker service update -d");
  if let Some(image) = &update.image {
    write!(command, " --image {image}").ok();
  }
  if let Some(replicas) = update.replicas {
    write!(command, " --replicas {}", replicas.max(1)).ok();
  }
  for variable in &update.env_rm {
    write!(command, " --env-rm {variable}").ok();
  }
  for (variable, value) in &update.env_add {
    write!(
      command,
      " --env-add {}",
      escape(&format!("{variable}={value}"))
    )
    .ok();
  }
  write!(command, " {name}").ok();
  command
}

impl DockerHost {
  pub async fn service_exists(
    &self,
    name: &str,
  ) -> anyhow::Result<bool> {
    let output = self
      .exec(format!(
        "docker service inspect --format '{{{{.ID}}}}' {name}"
      ))
      .await?;
    if output.success() {
      Ok(true)
    } else if is_not_found(&output) {
      Ok(false)
    } else {
      Err(anyhow::anyhow!("{}", output.stderr.trim())).context(
        format!("Failed to inspect service {name} on {}", self.name()),
      )
    }
  }

  pub async fn service_create(
    &self,
    spec: &ServiceSpec,
  ) -> anyhow::Result<()> {
    self
      .exec_check(service_create_command(spec))
      .await
      .with_context(|| {
        format!("Failed to create service {}", spec.name)
      })?;
    Ok(())
  }

  pub async fn service_update(
    &self,
    name: &str,
    update: &ServiceUpdate,
  ) -> anyhow::Result<()> {
    self
      .exec_check(service_update_command(name, update))
      .await
      .with_context(|| {
        format!("Failed to update service {name}")
      })?;
    Ok(())
  }

  /// Variable names currently set on a service's container spec.
  pub async fn service_env_names(
    &self,
    name: &str,
  ) -> anyhow::Result<Vec<String>> {
    let output = self
      .exec(format!(
        "docker service inspect --format '{{{{range .Spec.TaskTemplate.ContainerSpec.Env}}}}{{{{println .}}}}{{{{end}}}}' {name}"
      ))
      .await?;
    if !output.success() {
      return Ok(Vec::new());
    }
    Ok(
      output
        .stdout
        .lines()
        .filter_map(|line| {
          line.split_once('=').map(|(name, _)| name.to_string())
        })
        .collect(),
    )
  }

  /// Best-effort task states for a service, for post-update probes.
  pub async fn service_task_states(
    &self,
    name: &str,
  ) -> anyhow::Result<Vec<String>> {
    let output = self
      .exec(format!(
        "docker service ps {name} --format '{{{{.CurrentState}}}}'"
      ))
      .await?;
    Ok(
      output
        .stdout
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn create_command_with_constraint_and_network() {
    let spec = ServiceSpec {
      name: String::from("demo_prod_api"),
      image: String::from("demo-api:latest"),
      replicas: 2,
      network: Some(String::from("tako_demo_prod")),
      aliases: vec![String::from("api")],
      constraint: Some(String::from(
        "node.labels.server==alpha",
      )),
      ..Default::default()
    };
    let command = service_create_command(&spec);
    assert!(command.contains("--replicas 2"));
    assert!(
      command.contains("--network name=tako_demo_prod,alias=api")
    );
    assert!(command.contains("--constraint"));
    assert!(command.ends_with(" demo-api:latest"));
  }

  #[test]
  fn update_command_removes_then_adds_env() {
    let update = ServiceUpdate {
      image: Some(String::from("demo-api:v2")),
      replicas: Some(3),
      env_add: IndexMap::from([(
        String::from("PORT"),
        String::from("8080"),
      )]),
      env_rm: vec![String::from("OLD_VAR")],
    };
    let command =
      service_update_command("demo_prod_api", &update);
    assert_eq!(
      command,
      "docker service update -d --image demo-api:v2 --replicas 3 \
       --env-rm OLD_VAR --env-add PORT=8080 demo_prod_api"
    );
  }
}
