use std::{
  path::{Path, PathBuf},
  sync::OnceLock,
};

use clap::Parser;
use config::{Environment, ProjectConfig, Server};
use logger::{LogConfig, LogLevel};
use serde::Deserialize;
use ssh::{ConnectParams, HostKeyPolicy, KnownHosts};

use crate::args::CliArgs;

pub fn cli_args() -> &'static CliArgs {
  static CLI_ARGS: OnceLock<CliArgs> = OnceLock::new();
  CLI_ARGS.get_or_init(CliArgs::parse)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Env {
  /// Project config paths, comma separated.
  #[serde(default)]
  pub tako_config_paths: Option<Vec<PathBuf>>,
  #[serde(default)]
  pub tako_log_level: Option<LogLevel>,
  /// tofu | strict | ask | insecure
  #[serde(default)]
  pub tako_host_key_mode: Option<String>,
  /// Override for the tool-owned known hosts file.
  #[serde(default)]
  pub tako_known_hosts: Option<PathBuf>,
  /// Password fallback applied to servers without credentials.
  #[serde(default)]
  pub tako_ssh_password: Option<String>,
  /// Passphrase protecting the on-host swarm state blob.
  #[serde(default)]
  pub tako_state_key: Option<String>,
}

pub fn cli_env() -> &'static Env {
  static CLI_ENV: OnceLock<Env> = OnceLock::new();
  CLI_ENV.get_or_init(|| {
    envy::from_env().expect("Failed to parse tako environment")
  })
}

pub fn log_config() -> LogConfig {
  let level = cli_args()
    .log_level
    .map(LogLevel::from)
    .or(cli_env().tako_log_level)
    .unwrap_or_default();
  LogConfig {
    level,
    ..Default::default()
  }
}

pub fn host_key_policy() -> anyhow::Result<HostKeyPolicy> {
  match &cli_env().tako_host_key_mode {
    Some(mode) => Ok(mode.parse()?),
    None => Ok(HostKeyPolicy::default()),
  }
}

pub fn known_hosts_path() -> PathBuf {
  cli_env()
    .tako_known_hosts
    .clone()
    .unwrap_or_else(KnownHosts::default_path)
}

/// Connection parameters for one configured server, applying the
/// host key policy and the password fallback variable.
pub fn connect_params(
  server: &Server,
) -> anyhow::Result<ConnectParams> {
  Ok(ConnectParams {
    host: server.host.clone(),
    port: server.port,
    user: server.user.clone(),
    key_path: server.key_path.clone(),
    password: server
      .password
      .clone()
      .or_else(|| cli_env().tako_ssh_password.clone()),
    policy: host_key_policy()?,
    known_hosts: known_hosts_path(),
  })
}

pub fn project_config() -> &'static ProjectConfig {
  static PROJECT_CONFIG: OnceLock<ProjectConfig> = OnceLock::new();
  PROJECT_CONFIG.get_or_init(|| {
    let paths = config_paths();
    let paths =
      paths.iter().map(PathBuf::as_path).collect::<Vec<_>>();
    match config::load_project_config(&paths) {
      Ok(config) => config,
      Err(e) => {
        eprintln!("{e}");
        std::process::exit(1);
      }
    }
  })
}

fn config_paths() -> Vec<PathBuf> {
  if let Some(paths) = cli_args().config_path.clone() {
    return paths;
  }
  if let Some(paths) = cli_env().tako_config_paths.clone() {
    return paths;
  }
  // Default lookup: tako.{toml,yaml,yml,json} in the working directory.
  for candidate in
    ["tako.toml", "tako.yaml", "tako.yml", "tako.json"]
  {
    if Path::new(candidate).is_file() {
      return vec![PathBuf::from(candidate)];
    }
  }
  vec![PathBuf::from("tako.toml")]
}

/// Resolves the target environment: the named one, or the first
/// in the document.
pub fn resolve_environment<'a>(
  config: &'a ProjectConfig,
  name: Option<&str>,
) -> anyhow::Result<(String, &'a Environment)> {
  match name {
    Some(name) => {
      let environment = config.environment(name)?;
      Ok((name.to_string(), environment))
    }
    None => config
      .environments
      .first()
      .map(|(name, environment)| (name.clone(), environment))
      .ok_or_else(|| {
        anyhow::anyhow!("The project config declares no environments")
      }),
  }
}
