use anyhow::{Context, anyhow};
use colored::Colorize;

use crate::{
  args,
  command::{confirm, current_user, make_deployer},
  config::{project_config, resolve_environment},
  journal::{DeploymentRecord, DeploymentStatus},
  rollback,
};

pub async fn handle(args: &args::Rollback) -> anyhow::Result<()> {
  let project = project_config();
  let (environment_name, environment) = resolve_environment(
    project,
    args.environment.as_deref(),
  )?;
  let deployer =
    make_deployer(environment_name, environment).await?;

  let target = match &args.to {
    Some(id) => deployer
      .journal
      .get_record(id)
      .await?
      .ok_or_else(|| {
        anyhow!("no deployment record with id '{id}'")
      })?,
    None => {
      // Default target: the successful deployment before the
      // latest successful one.
      let history = deployer
        .journal
        .load_history()
        .await?
        .context("no deployment history for this project")?;
      history
        .deployments
        .iter()
        .filter(|r| r.status == DeploymentStatus::Success)
        .nth(1)
        .cloned()
        .context(
          "no previous successful deployment to roll back to",
        )?
    }
  };

  let snapshot = target
    .services
    .get(&args.service)
    .ok_or_else(|| {
      anyhow!(
        "deployment {} does not include service '{}'",
        target.id,
        args.service
      )
    })?
    .clone();

  confirm(
    &format!(
      "Roll back service '{}' to deployment {} (image {})?",
      args.service, target.id, snapshot.image
    ),
    args.yes,
  )?;

  rollback::rollback_service(&deployer, &snapshot)
    .await
    .with_context(|| {
      format!(
        "rollback of service '{}' to {} failed",
        args.service, target.id
      )
    })?;

  let mut record = DeploymentRecord::new(
    &project.name,
    &deployer.manager.server.host,
    &current_user(),
  );
  record.status = DeploymentStatus::RolledBack;
  record.message = format!(
    "rolled back service '{}' to deployment {}",
    args.service, target.id
  );
  record
    .services
    .insert(args.service.clone(), snapshot);
  deployer.journal.write_record(&record).await?;

  println!(
    "{}: service '{}' restored to deployment {}",
    "Rolled back".green().bold(),
    args.service,
    target.id
  );
  Ok(())
}
