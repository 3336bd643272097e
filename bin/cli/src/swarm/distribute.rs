use anyhow::{Context, anyhow};
use futures_util::future::try_join_all;
use ssh::SessionEvent;

use crate::docker::DockerHost;

/// Streams the image from the manager's `docker save` straight into
/// `docker load` on every worker that lacks it, in parallel, over
/// their respective SSH transports. No registry involved.
pub async fn distribute_image(
  manager: &DockerHost,
  workers: &[DockerHost],
  image: &str,
) -> anyhow::Result<()> {
  if workers.is_empty() {
    return Ok(());
  }
  try_join_all(
    workers
      .iter()
      .map(|worker| stream_to_worker(manager, worker, image)),
  )
  .await?;
  Ok(())
}

async fn stream_to_worker(
  manager: &DockerHost,
  worker: &DockerHost,
  image: &str,
) -> anyhow::Result<()> {
  if worker.image_exists(image).await? {
    debug!("{} already has image {image}", worker.name());
    return Ok(());
  }
  info!("streaming image {image} to {}", worker.name());

  let mut save = manager
    .client
    .start_session(&DockerHost::image_save_command(image))
    .await
    .with_context(|| {
      format!("Failed to start image save on {}", manager.name())
    })?;
  let mut load = worker
    .client
    .start_session(&DockerHost::image_load_command())
    .await
    .with_context(|| {
      format!("Failed to start image load on {}", worker.name())
    })?;

  let mut save_stderr = String::new();
  let mut save_status = None;
  while let Some(event) = save.next().await {
    match event {
      SessionEvent::Stdout(chunk) => {
        load.send(&chunk).await.with_context(|| {
          format!(
            "Image stream to {} broke mid-transfer",
            worker.name()
          )
        })?;
      }
      SessionEvent::Stderr(chunk) => {
        save_stderr.push_str(&String::from_utf8_lossy(&chunk));
      }
      SessionEvent::Exit(status) => save_status = Some(status),
    }
  }
  load.finish_input().await?;

  if save_status != Some(0) {
    let _ = load.terminate().await;
    return Err(anyhow!(
      "docker save of {image} failed on {} | {}",
      manager.name(),
      save_stderr.trim()
    ));
  }

  let mut load_stderr = String::new();
  let mut load_status = None;
  while let Some(event) = load.next().await {
    match event {
      SessionEvent::Stderr(chunk) => {
        load_stderr.push_str(&String::from_utf8_lossy(&chunk));
      }
      SessionEvent::Exit(status) => load_status = Some(status),
      SessionEvent::Stdout(_) => {}
    }
  }
  if load_status != Some(0) {
    return Err(anyhow!(
      "docker load of {image} failed on {} | {}",
      worker.name(),
      load_stderr.trim()
    ));
  }

  if !worker.image_exists(image).await? {
    return Err(anyhow!(
      "image {image} still missing on {} after streaming",
      worker.name()
    ));
  }
  Ok(())
}
