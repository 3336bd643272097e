use std::time::Duration;

use anyhow::{Context, anyhow};
use config::names;
use indexmap::IndexMap;

use crate::{
  deploy::{Deployer, volumes},
  docker::{HealthStatus, RunSpec, ServiceUpdate},
  journal::ServiceSnapshot,
};

/// Settle after a managed-service rewrite before probing.
const SERVICE_SETTLE: Duration = Duration::from_secs(5);

/// Health poll bounds for restored replicas.
const HEALTH_RETRIES: i64 = 5;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Materializes a service's state from a stored deployment record.
/// The target image must already exist on the host: rollback never
/// pulls.
pub async fn rollback_service(
  deployer: &Deployer,
  snapshot: &ServiceSnapshot,
) -> anyhow::Result<()> {
  let manager = &deployer.manager;

  // Stored image id first, name:tag as fallback.
  let image = if !snapshot.image_id.is_empty()
    && manager.image_exists(&snapshot.image_id).await?
  {
    snapshot.image_id.clone()
  } else if !snapshot.image.is_empty()
    && manager.image_exists(&snapshot.image).await?
  {
    snapshot.image.clone()
  } else {
    return Err(anyhow!(
      "neither image id '{}' nor image '{}' exists on {}. \
       Rollback does not re-pull images.",
      snapshot.image_id,
      snapshot.image,
      manager.name()
    ));
  };

  if deployer.cluster_mode() {
    rollback_managed_service(deployer, snapshot, &image).await
  } else {
    rollback_replicas(deployer, snapshot, &image).await
  }
}

/// Direct replica mode: tear the current replica set down, then
/// start the stored count from the stored image, env and port.
async fn rollback_replicas(
  deployer: &Deployer,
  snapshot: &ServiceSnapshot,
  image: &str,
) -> anyhow::Result<()> {
  let manager = &deployer.manager;
  let project = &deployer.project.name;
  let environment = &deployer.environment_name;
  let prefix =
    names::service_prefix(project, environment, &snapshot.name);

  for name in
    manager.list_containers_by_prefix(&prefix).await?
  {
    info!("removing {name} for rollback");
    manager
      .stop_container(
        &name,
        deployer.project.settings.stop_grace_seconds,
      )
      .await?;
    manager.remove_container(&name).await?;
  }

  // Proxy labels come from the *current* descriptor so a rollback
  // of a still-public service does not strand its route.
  let current = deployer.project.services.get(&snapshot.name);
  let labels = current
    .filter(|service| service.is_public())
    .and_then(|service| service.proxy.as_ref())
    .map(|proxy| proxy.labels.clone())
    .unwrap_or_default();
  let public = !labels.is_empty()
    || current.is_some_and(|service| service.is_public());
  let restart = current
    .map(|service| service.restart.clone())
    .unwrap_or_else(|| String::from("unless-stopped"));
  let mounts = current
    .map(|service| {
      volumes::scope_volumes(
        project,
        environment,
        &service.volumes,
      )
    })
    .unwrap_or_default();

  let replicas = snapshot.replicas.max(1);
  for replica in 1..=replicas {
    let name = names::container_name(
      project,
      environment,
      &snapshot.name,
      replica,
    );
    let mut env = snapshot.env.clone();
    env.insert(
      String::from("REPLICA_NUM"),
      replica.to_string(),
    );
    let mut aliases = vec![
      snapshot.name.clone(),
      names::replica_alias(&snapshot.name, replica),
    ];
    if current.is_some_and(|service| service.export) {
      aliases.push(names::export_alias(
        project,
        environment,
        &snapshot.name,
      ));
    }
    let spec = RunSpec {
      name: name.clone(),
      image: image.to_string(),
      restart: restart.clone(),
      network: Some(names::network_name(project, environment)),
      aliases,
      port_map: match (public, snapshot.port) {
        (false, Some(port)) => {
          Some((port + (replica - 1) as u16, port))
        }
        _ => None,
      },
      env,
      env_file: None,
      volumes: mounts.clone(),
      labels: labels.clone(),
      health_probe: snapshot
        .health_check
        .enabled
        .then(|| snapshot.port.map(|port| {
          (port, snapshot.health_check.path.clone())
        }))
        .flatten(),
    };
    manager.run_container(&spec).await.with_context(|| {
      format!("failed to start rollback replica {name}")
    })?;
    wait_restored(deployer, &name, snapshot).await?;
  }
  Ok(())
}

async fn wait_restored(
  deployer: &Deployer,
  name: &str,
  snapshot: &ServiceSnapshot,
) -> anyhow::Result<()> {
  let manager = &deployer.manager;
  if !snapshot.health_check.enabled {
    tokio::time::sleep(Duration::from_secs(3)).await;
    if manager.container_running(name).await? {
      return Ok(());
    }
    return Err(anyhow!(
      "rollback replica {name} is not running"
    ));
  }
  for _ in 0..HEALTH_RETRIES {
    match manager.container_health(name).await? {
      HealthStatus::Healthy => return Ok(()),
      HealthStatus::Unhealthy => {
        return Err(anyhow!(
          "rollback replica {name} reported unhealthy"
        ));
      }
      HealthStatus::Starting => {}
      HealthStatus::Unknown => {
        if manager.container_running(name).await? {
          return Ok(());
        }
        return Err(anyhow!(
          "rollback replica {name} is not running"
        ));
      }
    }
    tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
  }
  Err(anyhow!(
    "rollback replica {name} never became healthy"
  ))
}

/// Managed-service mode: one service-update rewriting image,
/// replica count and environment. Every prior variable is removed
/// by name, every stored variable added back.
async fn rollback_managed_service(
  deployer: &Deployer,
  snapshot: &ServiceSnapshot,
  image: &str,
) -> anyhow::Result<()> {
  let manager = &deployer.manager;
  let service_ref = deployer.service_ref(&snapshot.name);

  if !manager.service_exists(&service_ref).await? {
    return Err(anyhow!(
      "service {service_ref} does not exist in the cluster"
    ));
  }

  let prior_env =
    manager.service_env_names(&service_ref).await?;
  let env_add: IndexMap<String, String> =
    snapshot.env.clone();

  manager
    .service_update(
      &service_ref,
      &ServiceUpdate {
        image: Some(image.to_string()),
        replicas: Some(snapshot.replicas.max(1)),
        env_add,
        env_rm: prior_env,
      },
    )
    .await?;

  tokio::time::sleep(SERVICE_SETTLE).await;
  let states = manager
    .service_task_states(&service_ref)
    .await
    .unwrap_or_default();
  info!("{service_ref} task states after rollback: {states:?}");
  Ok(())
}
