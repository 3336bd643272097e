use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use config::{Service, Settings, names};
use futures_util::future::BoxFuture;
use indexmap::IndexMap;

use super::{hooks, maintenance, ports, volumes};
use crate::{
  docker::{DockerHost, HealthStatus, RunSpec, escape},
  journal::{HealthCheckState, ServiceSnapshot},
};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const NO_HEALTH_SETTLE: Duration = Duration::from_secs(3);
const LOG_TAIL_LINES: usize = 50;

/// Conventional reverse-proxy container, attached to every project
/// network so public services stay routable across projects.
pub const PROXY_CONTAINER: &str = "tako_proxy";

/// External acceptance check run against each fresh replica before
/// the switchover (database reachability and the like). The rollout
/// only knows the seam.
pub trait Verifier: Send + Sync {
  fn verify<'a>(
    &'a self,
    service: &'a str,
    replica: i64,
  ) -> BoxFuture<'a, anyhow::Result<()>>;
}

pub struct NoopVerifier;

impl Verifier for NoopVerifier {
  fn verify<'a>(
    &'a self,
    _service: &'a str,
    _replica: i64,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
  }
}

pub struct RolloutContext<'a> {
  pub project: &'a str,
  pub environment: &'a str,
  pub settings: &'a Settings,
  pub manager: &'a DockerHost,
  pub service_name: &'a str,
  pub service: &'a Service,
  /// Resolved full image reference (built or pre-built).
  pub image: &'a str,
  pub network: &'a str,
  /// Rendered secret env-file contents, uploaded per replica and
  /// deleted once the replica is up.
  pub secret_env: Option<&'a str>,
  /// The orchestrated pipeline shortens the drain window.
  pub drain_seconds: i64,
  pub verifier: &'a dyn Verifier,
}

/// The per-service blue-green protocol. On success every declared
/// replica runs under its canonical name; on failure the temp
/// container is gone and whatever ran before is untouched.
pub async fn deploy_service(
  ctx: &RolloutContext<'_>,
) -> anyhow::Result<ServiceSnapshot> {
  let service = ctx.service;

  hooks::validate_hooks(ctx.service_name, &service.hooks).await?;

  let merged_env = merged_environment(service).await?;

  hooks::run_hooks(
    "pre-deploy",
    &service.hooks.pre_deploy,
    &merged_env,
  )
  .await?;

  maintenance::clear_maintenance(
    ctx.manager,
    ctx.project,
    ctx.service_name,
  )
  .await?;

  let replicas = service.replica_count();
  for replica in 1..=replicas {
    deploy_replica(ctx, replica, &merged_env)
      .await
      .with_context(|| {
        format!(
          "replica {replica} of service '{}'",
          ctx.service_name
        )
      })?;
  }

  // A post-deploy failure fails the whole deployment even though
  // the new containers are already live. Documented behavior.
  hooks::run_hooks(
    "post-deploy",
    &service.hooks.post_deploy,
    &merged_env,
  )
  .await?;

  run_post_start_hooks(ctx).await?;

  scale_down(ctx, replicas).await?;

  if service.is_public() {
    attach_proxy_to_project_networks(ctx.manager).await;
  }

  snapshot(ctx, replicas, merged_env).await
}

async fn merged_environment(
  service: &Service,
) -> anyhow::Result<IndexMap<String, String>> {
  let file_env = match &service.env_file {
    Some(path) => environment::read_env_file(path).await?,
    None => Vec::new(),
  };
  Ok(environment::merge_env(&file_env, &service.env))
}

async fn deploy_replica(
  ctx: &RolloutContext<'_>,
  replica: i64,
  merged_env: &IndexMap<String, String>,
) -> anyhow::Result<()> {
  let manager = ctx.manager;
  let service = ctx.service;
  let canonical = names::container_name(
    ctx.project,
    ctx.environment,
    ctx.service_name,
    replica,
  );
  let temp = names::temp_name(&canonical);

  let old_exists =
    manager.container_exists(&canonical).await?;
  let target = if old_exists {
    // A leftover temp from a crashed run would collide.
    manager.remove_container(&temp).await?;
    temp.clone()
  } else {
    if replica == 1 {
      purge_legacy_containers(ctx).await;
    }
    canonical.clone()
  };

  let public = service.is_public();
  let host_port = if public {
    None
  } else {
    service.replica_port(replica)
  };

  // Non-public replicas bind host ports; make sure ours is free.
  if let Some(port) = host_port {
    ports::resolve_conflict(
      manager,
      port,
      &names::service_prefix(
        ctx.project,
        ctx.environment,
        ctx.service_name,
      ),
    )
    .await?;
  }

  let secret_path = match ctx.secret_env {
    Some(contents) => {
      let path = format!(
        "{}/.{}_{replica}.env",
        names::build_scratch_dir(ctx.project),
        ctx.service_name
      );
      manager
        .client
        .upload(contents.as_bytes(), &path, "0600")
        .await
        .context("Failed to upload secret env-file")?;
      Some(path)
    }
    None => None,
  };

  let mut aliases = vec![
    ctx.service_name.to_string(),
    names::replica_alias(ctx.service_name, replica),
  ];
  if service.export {
    aliases.push(names::export_alias(
      ctx.project,
      ctx.environment,
      ctx.service_name,
    ));
  }

  let mut env = merged_env.clone();
  env.insert(
    String::from("REPLICA_NUM"),
    replica.to_string(),
  );

  let mut mounts = volumes::scope_volumes(
    ctx.project,
    ctx.environment,
    &service.volumes,
  );
  // Legacy secret files stay mounted for services still reading them.
  for secret in &service.secrets {
    mounts.push(format!(
      "{}/secrets/{}/{secret}:/run/secrets/{secret}:ro",
      names::STATE_ROOT,
      ctx.project
    ));
  }

  let spec = RunSpec {
    name: target.clone(),
    image: ctx.image.to_string(),
    restart: service.restart.clone(),
    network: Some(ctx.network.to_string()),
    aliases,
    port_map: match (host_port, service.port) {
      (Some(host), Some(container)) => Some((host, container)),
      _ => None,
    },
    env,
    env_file: secret_path.clone(),
    volumes: mounts,
    labels: if public {
      service
        .proxy
        .as_ref()
        .map(|proxy| proxy.labels.clone())
        .unwrap_or_default()
    } else {
      Vec::new()
    },
    health_probe: service.health_check.as_ref().and_then(|hc| {
      service.port.map(|port| (port, hc.path.clone()))
    }),
  };

  if let Err(e) = manager.run_container(&spec).await {
    teardown(manager, &target).await;
    return Err(e);
  }

  if let Err(e) = wait_healthy(ctx, &target).await {
    teardown(manager, &target).await;
    return Err(e);
  }

  if let Err(e) =
    ctx.verifier.verify(ctx.service_name, replica).await
  {
    teardown(manager, &target).await;
    return Err(e.context("replica verification failed"));
  }

  if old_exists {
    // Give the proxy a drain window to rebalance onto the new
    // replica before the old one disappears.
    let drain = if ctx.drain_seconds <= 0 {
      ctx.settings.drain_seconds()
    } else {
      ctx.drain_seconds
    };
    debug!("draining {canonical} for {drain}s");
    tokio::time::sleep(Duration::from_secs(drain as u64)).await;
    manager
      .stop_container(
        &canonical,
        ctx.settings.stop_grace_seconds,
      )
      .await?;
    manager.remove_container(&canonical).await?;
    manager
      .rename_container(&target, &canonical)
      .await
      .with_context(|| {
        format!(
          "CRITICAL: failed to rename {target} to {canonical} after switchover. \
           The service is in an indeterminate state and needs operator intervention."
        )
      })?;
  }

  connect_imports(ctx, &canonical).await?;

  if let Some(path) = secret_path {
    manager.exec(format!("rm -f '{path}'")).await?;
  }

  Ok(())
}

/// Pre-replica-scheme container names this tool used to create.
/// Purged opportunistically on the first fresh replica.
async fn purge_legacy_containers(ctx: &RolloutContext<'_>) {
  let legacy = [
    format!("{}_{}", ctx.project, ctx.service_name),
    format!(
      "{}_{}_{}",
      ctx.project, ctx.environment, ctx.service_name
    ),
  ];
  for name in legacy {
    let _ = ctx.manager.remove_container(&name).await;
  }
}

/// Polls runtime health up to the configured retries. Without a
/// declared health check, a short settle then a running check.
async fn wait_healthy(
  ctx: &RolloutContext<'_>,
  name: &str,
) -> anyhow::Result<()> {
  let manager = ctx.manager;
  let Some(health_check) = &ctx.service.health_check else {
    tokio::time::sleep(NO_HEALTH_SETTLE).await;
    if manager.container_running(name).await? {
      return Ok(());
    }
    return Err(
      failure_with_logs(manager, name, "container is not running")
        .await,
    );
  };

  let retries = health_check.retry_count();
  for attempt in 1..=retries {
    match manager.container_health(name).await? {
      HealthStatus::Healthy => return Ok(()),
      HealthStatus::Unhealthy => {
        return Err(
          failure_with_logs(
            manager,
            name,
            "container reported unhealthy",
          )
          .await,
        );
      }
      HealthStatus::Starting => {}
      HealthStatus::Unknown => {
        // No health state from the runtime: running is good enough.
        if manager.container_running(name).await? {
          return Ok(());
        }
        return Err(
          failure_with_logs(
            manager,
            name,
            "container is not running",
          )
          .await,
        );
      }
    }
    if attempt < retries {
      tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
  }
  Err(
    failure_with_logs(
      manager,
      name,
      &format!("still starting after {retries} health checks"),
    )
    .await,
  )
}

async fn failure_with_logs(
  manager: &DockerHost,
  name: &str,
  reason: &str,
) -> anyhow::Error {
  let logs = manager
    .container_logs_tail(name, LOG_TAIL_LINES)
    .await
    .unwrap_or_default();
  anyhow!(
    "{name}: {reason}\n\nlast {LOG_TAIL_LINES} log lines:\n{}",
    logs.trim()
  )
}

/// Failed replicas never survive: stop and remove whatever was
/// started, temp name or not.
async fn teardown(manager: &DockerHost, name: &str) {
  if let Err(e) = manager.stop_container(name, 10).await {
    warn!("failed to stop {name} during teardown | {e:#}");
  }
  if let Err(e) = manager.remove_container(name).await {
    warn!("failed to remove {name} during teardown | {e:#}");
  }
}

/// Attaches the replica to each imported project's network so it
/// can resolve the exporter's global alias.
async fn connect_imports(
  ctx: &RolloutContext<'_>,
  container: &str,
) -> anyhow::Result<()> {
  for import in &ctx.service.imports {
    let Some((project, _service)) = import.split_once('.')
    else {
      continue;
    };
    if project == ctx.project {
      // Same project shares the service network already.
      continue;
    }
    let network =
      names::network_name(project, ctx.environment);
    if ctx.manager.network_exists(&network).await? {
      ctx
        .manager
        .connect_network(&network, container, &[])
        .await?;
    } else {
      warn!(
        "import '{import}': network {network} does not exist yet, skipping"
      );
    }
  }
  Ok(())
}

/// Post-start hooks run inside the first replica.
async fn run_post_start_hooks(
  ctx: &RolloutContext<'_>,
) -> anyhow::Result<()> {
  if ctx.service.hooks.post_start.is_empty() {
    return Ok(());
  }
  let first = names::container_name(
    ctx.project,
    ctx.environment,
    ctx.service_name,
    1,
  );
  for snippet in &ctx.service.hooks.post_start {
    ctx
      .manager
      .exec_check(format!(
        "docker exec {first} sh -c {}",
        escape(snippet)
      ))
      .await
      .with_context(|| {
        format!("post-start hook failed: {snippet}")
      })?;
  }
  Ok(())
}

/// Removes replicas numbered past the declared count. Containers
/// 1..=replicas are left untouched.
async fn scale_down(
  ctx: &RolloutContext<'_>,
  replicas: i64,
) -> anyhow::Result<()> {
  let prefix = names::service_prefix(
    ctx.project,
    ctx.environment,
    ctx.service_name,
  );
  for name in ctx
    .manager
    .list_containers_by_prefix(&prefix)
    .await?
  {
    let Some(suffix) = name.strip_prefix(&prefix) else {
      continue;
    };
    let Ok(number) = suffix.parse::<i64>() else {
      continue;
    };
    if number > replicas {
      info!("scaling down {name}");
      ctx
        .manager
        .stop_container(&name, ctx.settings.stop_grace_seconds)
        .await?;
      ctx.manager.remove_container(&name).await?;
    }
  }
  Ok(())
}

/// Cross-project visibility: the proxy must sit on every project
/// network to route to exported services. Best effort.
pub(crate) async fn attach_proxy_to_project_networks(
  manager: &DockerHost,
) {
  let proxy_exists = matches!(
    manager.container_exists(PROXY_CONTAINER).await,
    Ok(true)
  );
  if !proxy_exists {
    return;
  }
  let networks = match manager
    .list_networks_by_prefix("tako_")
    .await
  {
    Ok(networks) => networks,
    Err(e) => {
      warn!("could not list project networks | {e:#}");
      return;
    }
  };
  for network in networks {
    if let Err(e) = manager
      .connect_network(&network, PROXY_CONTAINER, &[])
      .await
    {
      warn!(
        "could not attach {PROXY_CONTAINER} to {network} | {e:#}"
      );
    }
  }
}

async fn snapshot(
  ctx: &RolloutContext<'_>,
  replicas: i64,
  env: IndexMap<String, String>,
) -> anyhow::Result<ServiceSnapshot> {
  let first = names::container_name(
    ctx.project,
    ctx.environment,
    ctx.service_name,
    1,
  );
  let brief = ctx
    .manager
    .container_brief(&first)
    .await?
    .unwrap_or_default();
  let (container_id, image_id, _image_ref) = brief;
  Ok(ServiceSnapshot {
    name: ctx.service_name.to_string(),
    image: ctx.image.to_string(),
    image_id,
    container_id,
    port: ctx.service.port,
    replicas,
    env,
    health_check: HealthCheckState {
      enabled: ctx.service.health_check.is_some(),
      path: ctx
        .service
        .health_check
        .as_ref()
        .map(|hc| hc.path.clone())
        .unwrap_or_default(),
      healthy: true,
      last_check: Some(Utc::now()),
    },
  })
}
