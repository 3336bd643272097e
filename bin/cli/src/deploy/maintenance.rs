use config::names;

use crate::docker::DockerHost;

/// Tears down an active maintenance placeholder for the service so
/// normal routing resumes, scratch directory included.
pub async fn clear_maintenance(
  host: &DockerHost,
  project: &str,
  service: &str,
) -> anyhow::Result<()> {
  let name = names::maintenance_container(project, service);
  if !host.container_exists(&name).await? {
    return Ok(());
  }
  info!("tearing down maintenance container {name}");
  host.stop_container(&name, 10).await?;
  host.remove_container(&name).await?;
  host
    .exec(format!(
      "rm -rf '{}/maintenance/{service}'",
      names::build_scratch_dir(project)
    ))
    .await?;
  Ok(())
}
