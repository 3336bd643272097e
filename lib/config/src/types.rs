use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The declarative project document (`tako.toml` / yaml / json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
  /// Logical project name. Scopes networks, volumes and state paths.
  pub name: String,

  #[serde(default)]
  pub settings: Settings,

  /// Service name -> descriptor.
  #[serde(default)]
  pub services: IndexMap<String, Service>,

  /// Environment name -> server list. The first server is the manager.
  #[serde(default)]
  pub environments: IndexMap<String, Environment>,
}

impl ProjectConfig {
  pub fn environment(&self, name: &str) -> Result<&Environment> {
    self.environments.get(name).ok_or_else(|| {
      Error::UnknownEnvironment {
        name: name.to_string(),
      }
    })
  }

  /// Light structural validation. The orchestration engine assumes
  /// these hold for every descriptor it receives.
  pub fn validate(&self) -> Result<()> {
    validate_name(&self.name)?;
    for (name, service) in &self.services {
      validate_name(name)?;
      if service.build.is_some() && !service.image.is_empty() {
        return Err(Error::BuildAndImage {
          service: name.clone(),
        });
      }
      if service.build.is_none() && service.image.is_empty() {
        return Err(Error::NoImageSource {
          service: name.clone(),
        });
      }
      for import in &service.imports {
        let mut parts = import.split('.');
        let valid = matches!(
          (parts.next(), parts.next(), parts.next()),
          (Some(project), Some(service), None)
            if !project.is_empty() && !service.is_empty()
        );
        if !valid {
          return Err(Error::InvalidImport {
            service: name.clone(),
            import: import.clone(),
          });
        }
      }
    }
    for (name, environment) in &self.environments {
      if environment.servers.is_empty() {
        return Err(Error::NoServers {
          environment: name.clone(),
        });
      }
    }
    Ok(())
  }
}

fn validate_name(name: &str) -> Result<()> {
  let ok = !name.is_empty()
    && name.chars().all(|c| {
      c.is_ascii_alphanumeric() || c == '-' || c == '_'
    });
  if ok {
    Ok(())
  } else {
    Err(Error::InvalidName {
      name: name.to_string(),
    })
  }
}

/// Project-level tunables for the deploy pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
  /// Parallel builds within a dependency layer.
  #[serde(default = "default_concurrency")]
  pub max_concurrent_builds: usize,
  /// Parallel deploys within a dependency layer.
  #[serde(default = "default_concurrency")]
  pub max_concurrent_deploys: usize,
  /// Seconds to wait after a new replica goes healthy before the
  /// old one is stopped, so the proxy can rebalance.
  #[serde(default = "default_drain_seconds")]
  pub drain_seconds: i64,
  /// Grace period passed to the runtime on container stop.
  #[serde(default = "default_stop_grace_seconds")]
  pub stop_grace_seconds: i64,
}

fn default_concurrency() -> usize {
  4
}
fn default_drain_seconds() -> i64 {
  30
}
fn default_stop_grace_seconds() -> i64 {
  30
}

impl Default for Settings {
  fn default() -> Settings {
    Settings {
      max_concurrent_builds: default_concurrency(),
      max_concurrent_deploys: default_concurrency(),
      drain_seconds: default_drain_seconds(),
      stop_grace_seconds: default_stop_grace_seconds(),
    }
  }
}

impl Settings {
  /// Non-positive drain windows fall back to the default.
  pub fn drain_seconds(&self) -> i64 {
    if self.drain_seconds <= 0 {
      default_drain_seconds()
    } else {
      self.drain_seconds
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
  /// Pre-built image reference. Mutually exclusive with `build`.
  #[serde(default)]
  pub image: String,

  /// Build context for manager-side image builds.
  #[serde(default)]
  pub build: Option<BuildConfig>,

  /// Desired replica count. Values below 1 are treated as 1.
  #[serde(default = "default_replicas")]
  pub replicas: i64,

  /// Internal container port.
  #[serde(default)]
  pub port: Option<u16>,

  /// Explicit environment. Wins over `env_file` on conflicts.
  #[serde(default)]
  pub env: IndexMap<String, String>,

  /// Optional dotenv file merged under the explicit environment.
  #[serde(default)]
  pub env_file: Option<PathBuf>,

  /// `source:destination[:options]` mounts. Non-absolute sources
  /// are named volumes and get scoped to the project + environment.
  #[serde(default)]
  pub volumes: Vec<String>,

  /// Secret references resolved by the secret loader.
  #[serde(default)]
  pub secrets: Vec<String>,

  /// Public reverse-proxy exposure. Opaque to the engine beyond
  /// "is this service public".
  #[serde(default)]
  pub proxy: Option<ProxyConfig>,

  /// Cross-project dependencies of the form `project.service`.
  #[serde(default)]
  pub imports: Vec<String>,

  #[serde(default)]
  pub hooks: Hooks,

  #[serde(default)]
  pub health_check: Option<HealthCheck>,

  /// Grants the globally-unique `{project}_{environment}_{service}`
  /// network alias so other projects can discover this service.
  #[serde(default)]
  pub export: bool,

  /// Restart policy handed to the runtime.
  #[serde(default = "default_restart")]
  pub restart: String,

  /// Placement constraint for cluster mode, eg `node.labels.gpu==true`.
  #[serde(default)]
  pub placement: Option<String>,
}

fn default_replicas() -> i64 {
  1
}

fn default_restart() -> String {
  String::from("unless-stopped")
}

impl Service {
  /// Replica counts of zero or below deploy a single replica.
  pub fn replica_count(&self) -> i64 {
    self.replicas.max(1)
  }

  pub fn is_public(&self) -> bool {
    self.proxy.is_some()
  }

  /// The host port for replica `i` (1-based) of a non-public service.
  pub fn replica_port(&self, replica: i64) -> Option<u16> {
    let port = self.port?;
    Some(port + (replica - 1).max(0) as u16)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
  /// Local build context directory.
  pub context: PathBuf,
  /// Dockerfile path relative to the context.
  #[serde(default)]
  pub dockerfile: Option<String>,
  /// `--build-arg` pairs.
  #[serde(default)]
  pub args: IndexMap<String, String>,
}

/// Reverse-proxy exposure block. The router labels are authored by
/// the proxy collaborator and carried through the engine untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
  pub domain: String,
  #[serde(default)]
  pub tls_email: String,
  #[serde(default)]
  pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
  #[serde(default)]
  pub pre_build: Vec<String>,
  #[serde(default)]
  pub post_build: Vec<String>,
  #[serde(default)]
  pub pre_deploy: Vec<String>,
  #[serde(default)]
  pub post_deploy: Vec<String>,
  #[serde(default)]
  pub post_start: Vec<String>,
}

impl Hooks {
  pub fn is_empty(&self) -> bool {
    self.pre_build.is_empty()
      && self.post_build.is_empty()
      && self.pre_deploy.is_empty()
      && self.post_deploy.is_empty()
      && self.post_start.is_empty()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
  /// HTTP path probed inside the container.
  pub path: String,
  /// Poll attempts, one second apart. Values below 1 mean 5.
  #[serde(default = "default_health_retries")]
  pub retries: i64,
}

fn default_health_retries() -> i64 {
  5
}

impl HealthCheck {
  pub fn retry_count(&self) -> i64 {
    if self.retries <= 0 {
      default_health_retries()
    } else {
      self.retries
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
  pub servers: Vec<Server>,
}

impl Environment {
  /// The first server. Builds, journal writes and swarm init land here.
  pub fn manager(&self) -> &Server {
    &self.servers[0]
  }

  pub fn workers(&self) -> &[Server] {
    &self.servers[1..]
  }

  pub fn is_multi_server(&self) -> bool {
    self.servers.len() > 1
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
  /// Label used for node labels and log attribution.
  pub name: String,
  pub host: String,
  #[serde(default = "default_ssh_port")]
  pub port: u16,
  #[serde(default = "default_ssh_user")]
  pub user: String,
  /// Explicit private key path. Preferred over agent and password.
  #[serde(default)]
  pub key_path: Option<PathBuf>,
  /// Password fallback when neither key nor agent authenticates.
  #[serde(default)]
  pub password: Option<String>,
}

fn default_ssh_port() -> u16 {
  22
}

fn default_ssh_user() -> String {
  String::from("root")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn service_with_image() -> Service {
    Service {
      image: String::from("nginx:1.25"),
      ..Default::default()
    }
  }

  #[test]
  fn replica_floor_is_one() {
    let mut service = service_with_image();
    service.replicas = 0;
    assert_eq!(service.replica_count(), 1);
    service.replicas = -3;
    assert_eq!(service.replica_count(), 1);
    service.replicas = 4;
    assert_eq!(service.replica_count(), 4);
  }

  #[test]
  fn replica_ports_offset_from_base() {
    let mut service = service_with_image();
    service.port = Some(8000);
    assert_eq!(service.replica_port(1), Some(8000));
    assert_eq!(service.replica_port(3), Some(8002));
  }

  #[test]
  fn drain_seconds_clamps_to_default() {
    let settings = Settings {
      drain_seconds: 0,
      ..Default::default()
    };
    assert_eq!(settings.drain_seconds(), 30);
    let settings = Settings {
      drain_seconds: 5,
      ..Default::default()
    };
    assert_eq!(settings.drain_seconds(), 5);
  }

  #[test]
  fn health_retries_clamp_to_default() {
    let check = HealthCheck {
      path: String::from("/"),
      retries: -1,
    };
    assert_eq!(check.retry_count(), 5);
  }

  #[test]
  fn import_syntax_is_validated() {
    let mut config = ProjectConfig {
      name: String::from("demo"),
      settings: Default::default(),
      services: Default::default(),
      environments: Default::default(),
    };
    let mut service = service_with_image();
    service.imports = vec![String::from("other.db")];
    config.services.insert(String::from("api"), service);
    config.validate().unwrap();

    config.services[0].imports = vec![String::from("nodot")];
    assert!(config.validate().is_err());
  }

  #[test]
  fn build_and_image_are_exclusive() {
    let mut config = ProjectConfig {
      name: String::from("demo"),
      settings: Default::default(),
      services: Default::default(),
      environments: Default::default(),
    };
    let mut service = service_with_image();
    service.build = Some(BuildConfig {
      context: PathBuf::from("."),
      dockerfile: None,
      args: Default::default(),
    });
    config.services.insert(String::from("api"), service);
    assert!(config.validate().is_err());
  }
}
