use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Rolling history keeps this many records, newest first.
pub const HISTORY_LIMIT: usize = 50;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentStatus {
  InProgress,
  Success,
  Failed,
  RolledBack,
}

/// One deployment. Created when the pipeline starts, moved to a
/// terminal status exactly once at pipeline exit, and never edited
/// afterward. The id is permanent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
  pub id: String,
  pub timestamp: DateTime<Utc>,
  pub project_name: String,
  #[serde(default)]
  pub version: String,
  pub status: DeploymentStatus,
  #[serde(default)]
  pub services: IndexMap<String, ServiceSnapshot>,
  #[serde(default)]
  pub user: String,
  /// The environment's manager host.
  #[serde(default)]
  pub host: String,
  /// Nanoseconds.
  #[serde(default)]
  pub duration: i64,
  #[serde(default)]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub git_commit: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub git_commit_short: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub git_branch: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub git_commit_msg: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub git_author: Option<String>,
}

impl DeploymentRecord {
  pub fn new(
    project_name: &str,
    host: &str,
    user: &str,
  ) -> DeploymentRecord {
    DeploymentRecord {
      id: new_deployment_id(),
      timestamp: Utc::now(),
      project_name: project_name.to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      status: DeploymentStatus::InProgress,
      services: Default::default(),
      user: user.to_string(),
      host: host.to_string(),
      duration: 0,
      message: String::new(),
      error: None,
      git_commit: None,
      git_commit_short: None,
      git_branch: None,
      git_commit_msg: None,
      git_author: None,
    }
  }
}

/// Monotonic nanosecond timestamp plus process id, unique across
/// concurrent invocations on one operator machine.
pub fn new_deployment_id() -> String {
  let nanos = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_nanos())
    .unwrap_or_default();
  format!("{nanos}-{}", std::process::id())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
  pub name: String,
  pub image: String,
  #[serde(default)]
  pub image_id: String,
  #[serde(default)]
  pub container_id: String,
  #[serde(default)]
  pub port: Option<u16>,
  #[serde(default)]
  pub replicas: i64,
  #[serde(default)]
  pub env: IndexMap<String, String>,
  #[serde(default)]
  pub health_check: HealthCheckState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckState {
  pub enabled: bool,
  #[serde(default)]
  pub path: String,
  #[serde(default)]
  pub healthy: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_check: Option<DateTime<Utc>>,
}

/// The rolling per project + environment history. `last_updated` is
/// the tiebreaker when recovering from worker copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentHistory {
  pub project_name: String,
  /// The manager host this history was written from.
  pub server: String,
  #[serde(default)]
  pub deployments: Vec<DeploymentRecord>,
  pub last_updated: DateTime<Utc>,
}

impl DeploymentHistory {
  pub fn new(project_name: &str, server: &str) -> DeploymentHistory {
    DeploymentHistory {
      project_name: project_name.to_string(),
      server: server.to_string(),
      deployments: Vec::new(),
      last_updated: Utc::now(),
    }
  }

  /// Upserts by id, keeps newest-first order, prunes past the cap
  /// and bumps `last_updated`.
  pub fn upsert(&mut self, record: DeploymentRecord) {
    self.deployments.retain(|r| r.id != record.id);
    self.deployments.push(record);
    self
      .deployments
      .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    self.deployments.truncate(HISTORY_LIMIT);
    self.last_updated = Utc::now();
  }

  pub fn get(&self, id: &str) -> Option<&DeploymentRecord> {
    self.deployments.iter().find(|r| r.id == id)
  }

  pub fn latest_successful(&self) -> Option<&DeploymentRecord> {
    self
      .deployments
      .iter()
      .find(|r| r.status == DeploymentStatus::Success)
  }

  /// The newest record older than the given one.
  pub fn previous_of(&self, id: &str) -> Option<&DeploymentRecord> {
    let target = self.get(id)?;
    self
      .deployments
      .iter()
      .find(|r| r.timestamp < target.timestamp)
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeDelta;

  use super::*;

  fn record_at(
    id: &str,
    minutes_ago: i64,
    status: DeploymentStatus,
  ) -> DeploymentRecord {
    let mut record = DeploymentRecord::new("demo", "alpha", "ci");
    record.id = id.to_string();
    record.timestamp =
      Utc::now() - TimeDelta::minutes(minutes_ago);
    record.status = status;
    record
  }

  #[test]
  fn record_serializes_with_camel_case_schema() {
    let mut record =
      record_at("100-1", 0, DeploymentStatus::Success);
    record.services.insert(
      String::from("api"),
      ServiceSnapshot {
        name: String::from("api"),
        image: String::from("nginx:1.25"),
        image_id: String::from("sha256:abc"),
        container_id: String::from("deadbeef"),
        port: Some(80),
        replicas: 2,
        env: Default::default(),
        health_check: HealthCheckState {
          enabled: true,
          path: String::from("/"),
          healthy: true,
          last_check: None,
        },
      },
    );
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["projectName"], "demo");
    assert_eq!(value["status"], "success");
    assert_eq!(value["services"]["api"]["imageId"], "sha256:abc");
    assert_eq!(
      value["services"]["api"]["containerId"],
      "deadbeef"
    );
    assert_eq!(
      value["services"]["api"]["healthCheck"]["enabled"],
      true
    );
    // Unset git metadata stays out of the document entirely.
    assert!(value.get("gitCommit").is_none());
    // RFC3339 timestamp.
    assert!(
      value["timestamp"].as_str().unwrap().contains('T')
    );
  }

  #[test]
  fn history_upsert_orders_newest_first() {
    let mut history = DeploymentHistory::new("demo", "alpha");
    history.upsert(record_at("b", 10, DeploymentStatus::Success));
    history.upsert(record_at("a", 20, DeploymentStatus::Success));
    history.upsert(record_at("c", 5, DeploymentStatus::Failed));
    let ids = history
      .deployments
      .iter()
      .map(|r| r.id.as_str())
      .collect::<Vec<_>>();
    assert_eq!(ids, ["c", "b", "a"]);
  }

  #[test]
  fn history_upsert_replaces_by_id() {
    let mut history = DeploymentHistory::new("demo", "alpha");
    history.upsert(record_at(
      "a",
      10,
      DeploymentStatus::InProgress,
    ));
    history.upsert(record_at("a", 10, DeploymentStatus::Success));
    assert_eq!(history.deployments.len(), 1);
    assert_eq!(
      history.deployments[0].status,
      DeploymentStatus::Success
    );
  }

  #[test]
  fn history_caps_at_limit_evicting_oldest() {
    let mut history = DeploymentHistory::new("demo", "alpha");
    for i in 0..(HISTORY_LIMIT + 1) {
      history.upsert(record_at(
        &format!("r{i}"),
        (HISTORY_LIMIT + 1 - i) as i64,
        DeploymentStatus::Success,
      ));
    }
    assert_eq!(history.deployments.len(), HISTORY_LIMIT);
    // The oldest record (r0) was evicted by the 51st write.
    assert!(history.get("r0").is_none());
    assert!(history.get("r1").is_some());
  }

  #[test]
  fn latest_successful_skips_failures() {
    let mut history = DeploymentHistory::new("demo", "alpha");
    history.upsert(record_at("a", 20, DeploymentStatus::Success));
    history.upsert(record_at("b", 10, DeploymentStatus::Failed));
    assert_eq!(history.latest_successful().unwrap().id, "a");
  }

  #[test]
  fn previous_of_returns_next_older() {
    let mut history = DeploymentHistory::new("demo", "alpha");
    history.upsert(record_at("a", 30, DeploymentStatus::Success));
    history.upsert(record_at("b", 20, DeploymentStatus::Success));
    history.upsert(record_at("c", 10, DeploymentStatus::Success));
    assert_eq!(history.previous_of("c").unwrap().id, "b");
    assert_eq!(history.previous_of("b").unwrap().id, "a");
    assert!(history.previous_of("a").is_none());
  }

  #[test]
  fn deployment_ids_carry_pid_suffix() {
    let id = new_deployment_id();
    let (_nanos, pid) = id.split_once('-').unwrap();
    assert_eq!(pid, std::process::id().to_string());
  }
}
