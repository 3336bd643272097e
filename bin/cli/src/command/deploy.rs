use anyhow::anyhow;
use colored::Colorize;
use comfy_table::Table;
use config::Service;
use formatting::format_serror;
use indexmap::IndexMap;

use crate::{
  args,
  command::{
    attach_git_metadata, confirm, current_user, make_deployer,
  },
  config::{project_config, resolve_environment},
  deploy::{self, PipelineReport},
  journal::{DeploymentRecord, DeploymentStatus},
};

pub async fn handle(args: &args::Deploy) -> anyhow::Result<()> {
  let project = project_config();
  let (environment_name, environment) = resolve_environment(
    project,
    args.environment.as_deref(),
  )?;

  let services = select_services(&args.services)?;

  confirm(
    &format!(
      "Deploy {} service(s) of project '{}' to environment '{}' ({} server(s))?",
      services.len(),
      project.name,
      environment_name,
      environment.servers.len()
    ),
    args.yes,
  )?;

  let deployer =
    make_deployer(environment_name, environment).await?;

  let mut record = DeploymentRecord::new(
    &project.name,
    &deployer.manager.server.host,
    &current_user(),
  );
  attach_git_metadata(&mut record).await;

  // The in_progress record lands before any stage runs. Losing it
  // is not fatal: the terminal write below is the one that counts.
  if let Err(e) = deployer.journal.write_record(&record).await {
    warn!("failed to write in-progress record | {e:#}");
  }

  let started = std::time::Instant::now();
  let result =
    deploy::run_pipeline(&deployer, &services).await;
  record.duration = started.elapsed().as_nanos() as i64;

  match result {
    Ok(report) => {
      record.status = DeploymentStatus::Success;
      record.services = report.snapshots.clone();
      record.message = format!(
        "deployed {} service(s) to {}",
        report.service_count, record.host
      );
      deployer.journal.write_record(&record).await?;
      if let Err(e) =
        deployer.journal.prune_stale_records().await
      {
        warn!("failed to prune stale records | {e:#}");
      }
      print_summary(&report);
      Ok(())
    }
    Err(e) => {
      record.status = DeploymentStatus::Failed;
      record.error = Some(format!("{e:#}"));
      if let Err(journal_err) =
        deployer.journal.write_record(&record).await
      {
        warn!(
          "failed to record deployment failure | {journal_err:#}"
        );
      }
      eprintln!("{}", format_serror(&e.into()));
      Err(anyhow!("deployment failed"))
    }
  }
}

fn select_services(
  requested: &[String],
) -> anyhow::Result<IndexMap<String, Service>> {
  let project = project_config();
  if requested.is_empty() {
    return Ok(project.services.clone());
  }
  let mut services = IndexMap::new();
  for name in requested {
    let service =
      project.services.get(name).ok_or_else(|| {
        anyhow!(
          "no service named '{name}' in project '{}'",
          project.name
        )
      })?;
    services.insert(name.clone(), service.clone());
  }
  Ok(services)
}

fn print_summary(report: &PipelineReport) {
  let mut table = Table::new();
  table.set_header(["Stage", "Duration"]);
  for stage in &report.stages {
    table.add_row([
      stage.name.to_string(),
      format!("{:.2?}", stage.duration),
    ]);
  }
  println!("{table}");
  println!(
    "{}: {} service(s) in {:.2?} (parallel speedup {:.2}x)",
    "Deployed".green().bold(),
    report.service_count,
    report.total,
    report.parallel_speedup,
  );
  for (service, image) in &report.images {
    println!("  {} -> {image}", service.bold());
  }
}
