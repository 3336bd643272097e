use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use config::names;
use ssh::{SessionEvent, SshClient};

mod record;
mod recover;
mod replicate;

pub use record::{
  DeploymentHistory, DeploymentRecord, DeploymentStatus,
  HealthCheckState, ServiceSnapshot, new_deployment_id,
};
pub use recover::recover_file_from_workers;

/// Hard cap on the background record / history replication fan-out.
const RECORD_REPLICATION_TIMEOUT: Duration =
  Duration::from_secs(30);

/// The journal owns deployment records: it is the only writer of
/// `{state-root}/{project}/*.json` on the manager, and replicates
/// them to workers best-effort.
pub struct Journal {
  pub project: String,
  pub manager_host: String,
  pub manager: Arc<SshClient>,
  pub workers: Vec<Arc<SshClient>>,
}

impl Journal {
  /// The manager's history, falling back to the freshest worker
  /// copy when the manager has none. Recovery failures degrade to
  /// an empty result, never an error.
  pub async fn load_history(
    &self,
  ) -> anyhow::Result<Option<DeploymentHistory>> {
    let path = names::history_path(&self.project);
    if let Some(bytes) =
      read_remote_file(&self.manager, &path).await?
    {
      let history = serde_json::from_slice(&bytes)
        .context("Failed to parse history.json on manager")?;
      return Ok(Some(history));
    }
    if self.workers.is_empty() {
      return Ok(None);
    }
    info!(
      "manager has no deployment history, recovering from workers"
    );
    let candidates: Vec<DeploymentHistory> =
      recover::recover_parsed_from_workers(&self.workers, &path)
        .await;
    Ok(
      candidates
        .into_iter()
        .max_by_key(|history| history.last_updated),
    )
  }

  /// Writes the per-deployment file, read-modify-writes the rolling
  /// history on the manager, then fires the background replication
  /// fan-out. Returns the updated history.
  pub async fn write_record(
    &self,
    record: &DeploymentRecord,
  ) -> anyhow::Result<DeploymentHistory> {
    let record_path =
      names::record_path(&self.project, &record.id);
    let record_bytes = serde_json::to_vec_pretty(record)
      .context("Failed to serialize deployment record")?;
    write_remote_file_atomic(
      &self.manager,
      &record_path,
      &record_bytes,
    )
    .await
    .context("Failed to write deployment record on manager")?;

    let mut history = self
      .load_history()
      .await?
      .unwrap_or_else(|| {
        DeploymentHistory::new(&self.project, &self.manager_host)
      });
    history.upsert(record.clone());
    let history_path = names::history_path(&self.project);
    let history_bytes = serde_json::to_vec_pretty(&history)
      .context("Failed to serialize deployment history")?;
    write_remote_file_atomic(
      &self.manager,
      &history_path,
      &history_bytes,
    )
    .await
    .context("Failed to write history.json on manager")?;

    // Best effort: the deployment returns as soon as the manager
    // write lands, not when replicas ack.
    replicate::replicate_files(
      self.workers.clone(),
      vec![
        (record_path, record_bytes),
        (history_path, history_bytes),
      ],
      RECORD_REPLICATION_TIMEOUT,
    );

    Ok(history)
  }

  pub async fn get_record(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<DeploymentRecord>> {
    let path = names::record_path(&self.project, id);
    if let Some(bytes) =
      read_remote_file(&self.manager, &path).await?
    {
      let record = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {path}"))?;
      return Ok(Some(record));
    }
    Ok(
      self
        .load_history()
        .await?
        .and_then(|history| history.get(id).cloned()),
    )
  }

  /// Removes per-deployment files no longer referenced by the
  /// rolling history.
  pub async fn prune_stale_records(&self) -> anyhow::Result<()> {
    let Some(history) = self.load_history().await? else {
      return Ok(());
    };
    let dir = names::state_dir(&self.project);
    let output = self
      .manager
      .execute(&format!("ls '{dir}'"))
      .await
      .context("Failed to list journal directory")?;
    if !output.success() {
      return Ok(());
    }
    for file in output.stdout.lines().map(str::trim) {
      let Some(id) = file.strip_suffix(".json") else {
        continue;
      };
      if id == "history" || history.get(id).is_some() {
        continue;
      }
      let _ = self
        .manager
        .execute(&format!("rm -f '{dir}/{file}'"))
        .await;
    }
    Ok(())
  }
}

/// Filters applied to history listings, newest-first.
#[derive(Debug, Default)]
pub struct HistoryFilter {
  pub status: Option<DeploymentStatus>,
  /// Wildcard pattern matched against deployed service names.
  pub service: Option<String>,
  pub since: Option<DateTime<Utc>>,
  pub include_failed: bool,
}

pub fn filter_records<'a>(
  history: &'a DeploymentHistory,
  filter: &HistoryFilter,
) -> Vec<&'a DeploymentRecord> {
  let service_pattern = filter
    .service
    .as_ref()
    .and_then(|p| wildcard::Wildcard::new(p.as_bytes()).ok());
  history
    .deployments
    .iter()
    .filter(|record| {
      if let Some(status) = filter.status
        && record.status != status
      {
        return false;
      }
      if !filter.include_failed
        && filter.status.is_none()
        && record.status == DeploymentStatus::Failed
      {
        return false;
      }
      if let Some(since) = filter.since
        && record.timestamp < since
      {
        return false;
      }
      if let Some(pattern) = &service_pattern
        && !record
          .services
          .keys()
          .any(|name| pattern.is_match(name.as_bytes()))
      {
        return false;
      }
      true
    })
    .collect()
}

/// Reads a remote file through base64 so binary contents survive
/// the text channel. None when the file does not exist.
pub async fn read_remote_file(
  client: &SshClient,
  path: &str,
) -> anyhow::Result<Option<Vec<u8>>> {
  let output = client
    .execute(&format!("base64 '{path}'"))
    .await
    .with_context(|| format!("Transport failure reading {path}"))?;
  if !output.success() {
    return Ok(None);
  }
  let compact: String = output
    .stdout
    .chars()
    .filter(|c| !c.is_whitespace())
    .collect();
  let bytes = STANDARD
    .decode(compact)
    .with_context(|| format!("Invalid base64 content in {path}"))?;
  Ok(Some(bytes))
}

/// Uploads through base64-over-stdin into a temp file, then moves
/// it in place. Readers observe either the pre- or post-write
/// state, never a partial file.
pub async fn write_remote_file_atomic(
  client: &SshClient,
  path: &str,
  bytes: &[u8],
) -> anyhow::Result<()> {
  let command = atomic_write_command(path);
  let mut session = client
    .start_session(&command)
    .await
    .with_context(|| format!("Failed to start upload to {path}"))?;
  let encoded = STANDARD.encode(bytes);
  session.send(encoded.as_bytes()).await?;
  session.finish_input().await?;
  let mut stderr = String::new();
  let mut exit = None;
  while let Some(event) = session.next().await {
    match event {
      SessionEvent::Stderr(chunk) => {
        stderr.push_str(&String::from_utf8_lossy(&chunk));
      }
      SessionEvent::Exit(status) => exit = Some(status),
      SessionEvent::Stdout(_) => {}
    }
  }
  if exit == Some(0) {
    Ok(())
  } else {
    Err(anyhow!(
      "Failed to write {path}: {}",
      stderr.trim()
    ))
  }
}

/// Decode into a temp file, then rename into place. The rename is
/// what makes concurrent readers safe.
fn atomic_write_command(path: &str) -> String {
  let dir = match path.rsplit_once('/') {
    Some((dir, _)) if !dir.is_empty() => dir,
    _ => ".",
  };
  let tmp = format!("{path}.tmp.{}", std::process::id());
  format!(
    "mkdir -p '{dir}' && base64 -d > '{tmp}' && mv '{tmp}' '{path}'"
  )
}

#[cfg(test)]
mod tests {
  use chrono::TimeDelta;

  use super::*;

  fn history_with(
    entries: &[(&str, i64, DeploymentStatus, &str)],
  ) -> DeploymentHistory {
    let mut history = DeploymentHistory::new("demo", "alpha");
    for (id, minutes_ago, status, service) in entries {
      let mut record =
        DeploymentRecord::new("demo", "alpha", "ci");
      record.id = id.to_string();
      record.timestamp =
        Utc::now() - TimeDelta::minutes(*minutes_ago);
      record.status = *status;
      record.services.insert(
        service.to_string(),
        ServiceSnapshot {
          name: service.to_string(),
          ..Default::default()
        },
      );
      history.upsert(record);
    }
    history
  }

  #[test]
  fn writes_land_through_a_temp_file_and_rename() {
    let command = atomic_write_command(
      "/var/lib/tako-cli/demo/history.json",
    );
    let pid = std::process::id();
    assert_eq!(
      command,
      format!(
        "mkdir -p '/var/lib/tako-cli/demo' && \
         base64 -d > '/var/lib/tako-cli/demo/history.json.tmp.{pid}' && \
         mv '/var/lib/tako-cli/demo/history.json.tmp.{pid}' '/var/lib/tako-cli/demo/history.json'"
      )
    );
  }

  #[test]
  fn failed_records_hidden_unless_requested() {
    let history = history_with(&[
      ("a", 30, DeploymentStatus::Success, "api"),
      ("b", 20, DeploymentStatus::Failed, "api"),
    ]);
    let visible =
      filter_records(&history, &HistoryFilter::default());
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, "a");
    let all = filter_records(
      &history,
      &HistoryFilter {
        include_failed: true,
        ..Default::default()
      },
    );
    assert_eq!(all.len(), 2);
  }

  #[test]
  fn explicit_status_filter_overrides_failed_hiding() {
    let history = history_with(&[
      ("a", 30, DeploymentStatus::Success, "api"),
      ("b", 20, DeploymentStatus::Failed, "api"),
    ]);
    let failed = filter_records(
      &history,
      &HistoryFilter {
        status: Some(DeploymentStatus::Failed),
        ..Default::default()
      },
    );
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "b");
  }

  #[test]
  fn service_filter_supports_wildcards() {
    let history = history_with(&[
      ("a", 30, DeploymentStatus::Success, "api"),
      ("b", 20, DeploymentStatus::Success, "worker"),
    ]);
    let matched = filter_records(
      &history,
      &HistoryFilter {
        service: Some(String::from("api*")),
        ..Default::default()
      },
    );
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id, "a");
  }

  #[test]
  fn results_stay_newest_first() {
    let history = history_with(&[
      ("old", 60, DeploymentStatus::Success, "api"),
      ("new", 5, DeploymentStatus::Success, "api"),
      ("mid", 30, DeploymentStatus::Success, "api"),
    ]);
    let visible =
      filter_records(&history, &HistoryFilter::default());
    let ids =
      visible.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, ["new", "mid", "old"]);
  }
}
