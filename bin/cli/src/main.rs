#[macro_use]
extern crate tracing;

use anyhow::Context;

mod args;
mod command;
mod config;
mod deploy;
mod docker;
mod journal;
mod rollback;
mod swarm;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  logger::init(&config::log_config())?;

  match &config::cli_args().command {
    args::Command::Config { unsanitized } => {
      let mut config = config::project_config().clone();
      if !*unsanitized {
        for environment in config.environments.values_mut() {
          for server in &mut environment.servers {
            if server.password.is_some() {
              server.password = Some(String::from("*****"));
            }
          }
        }
      }
      println!(
        "\nProject Config {}",
        serde_json::to_string_pretty(&config)
          .context("Failed to serialize config for pretty print")?
      );
      Ok(())
    }
    args::Command::Deploy(deploy) => {
      command::deploy::handle(deploy).await
    }
    args::Command::Rollback(rollback) => {
      command::rollback::handle(rollback).await
    }
    args::Command::History(history) => {
      command::history::handle(history).await
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = app() => res,
    _ = term_signal.recv() => Ok(()),
  }
}
