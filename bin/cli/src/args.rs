//! Module for parsing the tako CLI arguments

use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[command(
  name = "tako",
  version,
  about = "Agentless container orchestration over SSH",
  author
)]
pub struct CliArgs {
  /// The command to run
  #[command(subcommand)]
  pub command: Command,

  /// Sets the path of a project config file or directory to use.
  /// Can use multiple times.
  #[arg(long, short = 'c')]
  pub config_path: Option<Vec<PathBuf>>,

  /// Log level override (trace, debug, info, warn, error).
  #[arg(long, short = 'l')]
  pub log_level: Option<tracing::Level>,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
  /// Deploy services to an environment. (aliases: `up`, `dep`)
  #[clap(alias = "up", alias = "dep")]
  Deploy(Deploy),

  /// Roll a service back to a previous deployment. (alias: `rb`)
  #[clap(alias = "rb")]
  Rollback(Rollback),

  /// Show deployment history. (aliases: `hist`, `ls`)
  #[clap(alias = "hist", alias = "ls")]
  History(History),

  /// Print the resolved project config. (aliases: `cfg`, `cf`)
  #[clap(alias = "cfg", alias = "cf")]
  Config {
    /// Whether to print unsanitized config,
    /// including server passwords.
    #[arg(long, action)]
    unsanitized: bool,
  },
}

#[derive(Debug, Clone, clap::Parser)]
pub struct Deploy {
  /// Services to deploy. All services when empty.
  pub services: Vec<String>,

  /// Target environment. Defaults to the first one in the config.
  #[arg(long, short = 'e')]
  pub environment: Option<String>,

  /// Always continue on user confirmation prompts.
  #[arg(long, short = 'y', default_value_t = false)]
  pub yes: bool,
}

#[derive(Debug, Clone, clap::Parser)]
pub struct Rollback {
  /// The service to roll back.
  pub service: String,

  /// Target deployment id. Defaults to the deployment before the
  /// latest successful one.
  #[arg(long, short = 't')]
  pub to: Option<String>,

  /// Target environment. Defaults to the first one in the config.
  #[arg(long, short = 'e')]
  pub environment: Option<String>,

  /// Always continue on user confirmation prompts.
  #[arg(long, short = 'y', default_value_t = false)]
  pub yes: bool,
}

#[derive(Debug, Clone, clap::Parser)]
pub struct History {
  /// Target environment. Defaults to the first one in the config.
  #[arg(long, short = 'e')]
  pub environment: Option<String>,

  /// Filter by status (success, failed, rolled_back, in_progress).
  #[arg(long, short = 's')]
  pub status: Option<String>,

  /// Filter by service name. Supports wildcard syntax.
  #[arg(long)]
  pub service: Option<String>,

  /// Only records at or after this RFC3339 timestamp.
  #[arg(long)]
  pub since: Option<String>,

  /// Include failed deployments.
  #[arg(long, short = 'a', default_value_t = false)]
  pub all: bool,

  /// Max records to show.
  #[arg(long, short = 'n', default_value_t = 20)]
  pub limit: usize,

  /// Output format.
  #[arg(long, short = 'f', default_value_t = Default::default())]
  pub format: CliFormat,
}

#[derive(
  Debug, Clone, Copy, Default, strum::Display, clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub enum CliFormat {
  /// Table output format. Default. (alias: `t`)
  #[default]
  #[clap(alias = "t")]
  Table,
  /// Json output format. (alias: `j`)
  #[clap(alias = "j")]
  Json,
}
