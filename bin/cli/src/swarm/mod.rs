use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use chrono::Utc;
use config::Service;

use crate::docker::DockerHost;

mod distribute;
mod state;

pub use distribute::distribute_image;
pub use state::{SwarmState, load_state, persist_state};

/// Settle window after cluster init before issuing further commands.
const INIT_SETTLE: Duration = Duration::from_secs(2);

/// Owns the multi-host topology: cluster init on the manager,
/// worker joins, node labels, broken-membership recovery, and the
/// encrypted state blob.
pub struct ClusterCoordinator<'a> {
  pub project: &'a str,
  pub environment: &'a str,
  pub manager: &'a DockerHost,
  pub workers: &'a [DockerHost],
  /// Passphrase for the state blob. Skips persistence when unset.
  pub state_key: Option<&'a str>,
}

impl ClusterCoordinator<'_> {
  /// Brings the cluster to the declared topology. Safe to run on
  /// every deploy: each step probes before acting.
  pub async fn ensure_cluster(&self) -> anyhow::Result<()> {
    if !self.manager.swarm_active().await? {
      // A persisted state blob with an inactive manager means the
      // cluster was torn down or the manager was replaced.
      if let Some(passphrase) = self.state_key
        && let Ok(Some(previous)) = load_state(
          self.project,
          passphrase,
          &self.manager.client,
          &self
            .workers
            .iter()
            .map(|w| w.client.clone())
            .collect::<Vec<_>>(),
        )
        .await
      {
        warn!(
          "found cluster state from {} ({} node(s)), re-initializing",
          previous.last_updated, previous.nodes.len()
        );
      }
      info!(
        "initializing cluster on manager {}",
        self.manager.name()
      );
      self
        .manager
        .swarm_init(&self.manager.server.host)
        .await?;
      tokio::time::sleep(INIT_SETTLE).await;
    }

    let token = self.manager.swarm_worker_token().await?;

    for worker in self.workers {
      self.ensure_worker_joined(worker, &token).await?;
    }

    self.apply_labels().await?;

    if let Some(passphrase) = self.state_key {
      let state = SwarmState {
        manager_host: self.manager.server.host.clone(),
        worker_token: token,
        nodes: std::iter::once(self.manager.name().to_string())
          .chain(
            self.workers.iter().map(|w| w.name().to_string()),
          )
          .collect(),
        last_updated: Utc::now(),
      };
      persist_state(
        self.project,
        &state,
        passphrase,
        &self.manager.client,
        self
          .workers
          .iter()
          .map(|w| w.client.clone())
          .collect::<Vec<Arc<ssh::SshClient>>>(),
      )
      .await?;
    }

    Ok(())
  }

  async fn ensure_worker_joined(
    &self,
    worker: &DockerHost,
    token: &str,
  ) -> anyhow::Result<()> {
    let probe = worker.exec("docker version").await?;
    if !probe.success() {
      // Host provisioning is the setup collaborator's job.
      return Err(anyhow!(
        "container runtime missing on {} ({}) | provision the host first (tako setup)",
        worker.name(),
        worker.server.host
      ));
    }

    if !worker.swarm_active().await? {
      info!("joining {} to the cluster", worker.name());
      return worker
        .swarm_join(&self.manager.server.host, token)
        .await;
    }

    // Active on the worker's side but possibly unknown to the
    // manager: a stale membership from a previous cluster.
    let hostname = worker.node_hostname().await?;
    if self
      .manager
      .node_id_by_hostname(&hostname)
      .await?
      .is_none()
    {
      warn!(
        "{} reports an active cluster the manager cannot resolve, rejoining",
        worker.name()
      );
      worker.swarm_leave_force().await?;
      worker
        .swarm_join(&self.manager.server.host, token)
        .await
        .with_context(|| {
          format!(
            "{} failed to rejoin after forced leave",
            worker.name()
          )
        })?;
    }
    Ok(())
  }

  /// Every node gets `environment` and `server` labels; the manager
  /// additionally `role=manager`.
  async fn apply_labels(&self) -> anyhow::Result<()> {
    let nodes = std::iter::once(self.manager)
      .chain(self.workers.iter());
    for node in nodes {
      let hostname = node.node_hostname().await?;
      let node_id = self
        .manager
        .node_id_by_hostname(&hostname)
        .await?
        .with_context(|| {
          format!(
            "cluster does not resolve node {} ({hostname})",
            node.name()
          )
        })?;
      self
        .manager
        .node_label_set(&node_id, "environment", self.environment)
        .await?;
      self
        .manager
        .node_label_set(&node_id, "server", node.name())
        .await?;
      if node.name() == self.manager.name() {
        self
          .manager
          .node_label_set(&node_id, "role", "manager")
          .await?;
      }
    }
    Ok(())
  }
}

/// Placement for cluster-mode services. User constraints win; on a
/// single-server cluster the service is pinned to the manager
/// because that is where the image was built and never distributed.
pub fn placement_constraint(
  service: &Service,
  single_server: bool,
  manager_name: &str,
) -> Option<String> {
  if let Some(constraint) = &service.placement {
    return Some(constraint.clone());
  }
  single_server
    .then(|| format!("node.labels.server=={manager_name}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_server_pins_to_manager() {
    let service = Service::default();
    assert_eq!(
      placement_constraint(&service, true, "alpha").as_deref(),
      Some("node.labels.server==alpha")
    );
  }

  #[test]
  fn multi_server_omits_constraint() {
    let service = Service::default();
    assert_eq!(
      placement_constraint(&service, false, "alpha"),
      None
    );
  }

  #[test]
  fn user_constraint_wins() {
    let service = Service {
      placement: Some(String::from("node.labels.gpu==true")),
      ..Default::default()
    };
    assert_eq!(
      placement_constraint(&service, true, "alpha").as_deref(),
      Some("node.labels.gpu==true")
    );
  }
}
