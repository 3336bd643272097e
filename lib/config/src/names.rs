//! Canonical names shared by the rollout engine, the journal and the
//! cluster coordinator. Everything that lands on a remote host is
//! derived from these helpers so the naming invariants hold globally.

/// Root of the on-host deployment state tree.
pub const STATE_ROOT: &str = "/var/lib/tako-cli";

/// Suffix adopted by the incoming container during a blue-green swap.
pub const TEMP_SUFFIX: &str = "_new";

/// `{project}_{environment}_{service}_{replica}`, 1-based replicas.
pub fn container_name(
  project: &str,
  environment: &str,
  service: &str,
  replica: i64,
) -> String {
  format!("{project}_{environment}_{service}_{replica}")
}

pub fn temp_name(canonical: &str) -> String {
  format!("{canonical}{TEMP_SUFFIX}")
}

/// Prefix matching every replica of a service, trailing underscore
/// included so `api` does not match `api-worker`.
pub fn service_prefix(
  project: &str,
  environment: &str,
  service: &str,
) -> String {
  format!("{project}_{environment}_{service}_")
}

/// Per project + environment network.
pub fn network_name(project: &str, environment: &str) -> String {
  format!("tako_{project}_{environment}")
}

/// Globally-unique alias granted to exported services.
pub fn export_alias(
  project: &str,
  environment: &str,
  service: &str,
) -> String {
  format!("{project}_{environment}_{service}")
}

/// Alias addressing one specific replica on the project network.
pub fn replica_alias(service: &str, replica: i64) -> String {
  format!("{service}_{replica}")
}

/// Placeholder container checked by the maintenance gate.
pub fn maintenance_container(project: &str, service: &str) -> String {
  format!("{project}_{service}_maintenance")
}

/// Named-volume sources are rewritten so volumes are never shared
/// across environments. Absolute paths are bind mounts and pass
/// through unchanged, drive-letter paths included.
pub fn scoped_volume_source(
  project: &str,
  environment: &str,
  source: &str,
) -> String {
  if is_bind_source(source) {
    source.to_string()
  } else {
    format!("{project}_{environment}_{source}")
  }
}

pub fn is_bind_source(source: &str) -> bool {
  if source.starts_with('/') {
    return true;
  }
  // Windows drive-letter bind mounts, eg `C:\data` or `C:/data`.
  let mut chars = source.chars();
  matches!(
    (chars.next(), chars.next(), chars.next()),
    (Some(drive), Some(':'), Some('/' | '\\'))
      if drive.is_ascii_alphabetic()
  )
}

pub fn state_dir(project: &str) -> String {
  format!("{STATE_ROOT}/{project}")
}

pub fn record_path(project: &str, deployment_id: &str) -> String {
  format!("{STATE_ROOT}/{project}/{deployment_id}.json")
}

pub fn history_path(project: &str) -> String {
  format!("{STATE_ROOT}/{project}/history.json")
}

pub fn swarm_state_path(project: &str) -> String {
  format!("{STATE_ROOT}/{project}/swarm_state.enc")
}

/// Ephemeral build scratch where uploaded contexts are extracted.
pub fn build_scratch_dir(project: &str) -> String {
  format!("/opt/{project}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn container_names_follow_scheme() {
    assert_eq!(
      container_name("demo", "prod", "api", 2),
      "demo_prod_api_2"
    );
    assert_eq!(
      temp_name(&container_name("demo", "prod", "api", 2)),
      "demo_prod_api_2_new"
    );
  }

  #[test]
  fn network_and_export_alias() {
    assert_eq!(network_name("demo", "prod"), "tako_demo_prod");
    assert_eq!(
      export_alias("demo", "prod", "api"),
      "demo_prod_api"
    );
  }

  #[test]
  fn named_volumes_are_scoped() {
    assert_eq!(
      scoped_volume_source("demo", "prod", "data"),
      "demo_prod_data"
    );
  }

  #[test]
  fn bind_mounts_pass_through() {
    assert_eq!(
      scoped_volume_source("demo", "prod", "/etc/hosts"),
      "/etc/hosts"
    );
    assert_eq!(
      scoped_volume_source("demo", "prod", "C:\\data"),
      "C:\\data"
    );
    assert_eq!(
      scoped_volume_source("demo", "prod", "D:/data"),
      "D:/data"
    );
  }

  #[test]
  fn state_paths() {
    assert_eq!(
      record_path("demo", "123-9"),
      "/var/lib/tako-cli/demo/123-9.json"
    );
    assert_eq!(
      history_path("demo"),
      "/var/lib/tako-cli/demo/history.json"
    );
    assert_eq!(
      swarm_state_path("demo"),
      "/var/lib/tako-cli/demo/swarm_state.enc"
    );
    assert_eq!(build_scratch_dir("demo"), "/opt/demo");
  }
}
