use anyhow::Context;
use colored::Colorize;
use comfy_table::Table;

use crate::{
  args::{self, CliFormat},
  command::make_deployer,
  config::{project_config, resolve_environment},
  journal::{
    DeploymentStatus, HistoryFilter, filter_records,
  },
};

pub async fn handle(args: &args::History) -> anyhow::Result<()> {
  let project = project_config();
  let (environment_name, environment) = resolve_environment(
    project,
    args.environment.as_deref(),
  )?;
  let deployer =
    make_deployer(environment_name, environment).await?;

  let Some(history) = deployer.journal.load_history().await?
  else {
    println!(
      "No deployment history for project '{}'",
      project.name
    );
    return Ok(());
  };

  let status = args
    .status
    .as_deref()
    .map(|raw| {
      raw
        .parse::<DeploymentStatus>()
        .with_context(|| format!("invalid status '{raw}'"))
    })
    .transpose()?;

  let since = args
    .since
    .as_deref()
    .map(|raw| {
      chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.to_utc())
        .with_context(|| {
          format!("invalid --since timestamp '{raw}'")
        })
    })
    .transpose()?;

  let filter = HistoryFilter {
    status,
    service: args.service.clone(),
    since,
    include_failed: args.all,
  };
  let records = filter_records(&history, &filter);
  let records =
    records.into_iter().take(args.limit).collect::<Vec<_>>();

  match args.format {
    CliFormat::Json => {
      println!("{}", serde_json::to_string_pretty(&records)?);
    }
    CliFormat::Table => {
      let mut table = Table::new();
      table.set_header([
        "ID", "Status", "Services", "User", "When", "Message",
      ]);
      for record in &records {
        table.add_row([
          record.id.clone(),
          status_cell(record.status),
          record
            .services
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
          record.user.clone(),
          record
            .timestamp
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
          record.message.clone(),
        ]);
      }
      println!("{table}");
      println!(
        "history last updated {}",
        history
          .last_updated
          .format("%Y-%m-%d %H:%M:%S")
          .to_string()
          .dimmed()
      );
    }
  }
  Ok(())
}

fn status_cell(status: DeploymentStatus) -> String {
  match status {
    DeploymentStatus::Success => {
      status.to_string().green().to_string()
    }
    DeploymentStatus::Failed => {
      status.to_string().red().to_string()
    }
    DeploymentStatus::RolledBack => {
      status.to_string().yellow().to_string()
    }
    DeploymentStatus::InProgress => {
      status.to_string().blue().to_string()
    }
  }
}
