use anyhow::{Context, anyhow};
use config::{Service, names};

use super::{archive, hooks};
use crate::docker::{DockerHost, escape};

/// Resolves the full image reference for a service, building on the
/// manager when a build context is declared. Pre-built images pass
/// through untouched.
pub async fn resolve_image(
  manager: &DockerHost,
  project: &str,
  environment: &str,
  service_name: &str,
  service: &Service,
) -> anyhow::Result<String> {
  let Some(build) = &service.build else {
    return Ok(service.image.clone());
  };

  hooks::run_hooks(
    "pre-build",
    &service.hooks.pre_build,
    &service.env,
  )
  .await?;

  let tag = format!("{project}_{environment}_{service_name}:latest");
  let scratch = format!(
    "{}/{service_name}",
    names::build_scratch_dir(project)
  );
  let archive_path = format!("{scratch}.tar.gz");

  // Pack locally off the async runtime.
  let context = build.context.clone();
  let bytes =
    tokio::task::spawn_blocking(move || {
      archive::pack_context(&context)
    })
    .await
    .context("Context packing task panicked")?
    .with_context(|| {
      format!(
        "Failed to pack build context for service '{service_name}'"
      )
    })?;

  info!(
    "uploading build context for {service_name} ({} bytes)",
    bytes.len()
  );
  manager
    .client
    .upload(&bytes, &archive_path, "0600")
    .await
    .context("Failed to upload build context to manager")?;
  manager
    .exec_check(format!(
      "rm -rf '{scratch}' && mkdir -p '{scratch}' && tar -xzf '{archive_path}' -C '{scratch}' && rm -f '{archive_path}'"
    ))
    .await
    .context("Failed to extract build context on manager")?;

  let dockerfile = build
    .dockerfile
    .as_deref()
    .map(|f| format!(" -f {}", escape(&format!("{scratch}/{f}"))))
    .unwrap_or_default();
  let build_args = build
    .args
    .iter()
    .map(|(variable, value)| {
      format!(
        " --build-arg {}",
        escape(&format!("{variable}={value}"))
      )
    })
    .collect::<String>();
  let build_command = format!(
    "docker build -t {tag}{dockerfile}{build_args} '{scratch}'"
  );

  info!("building {tag} on {}", manager.name());
  let output = manager
    .client
    .execute_streaming(
      &build_command,
      |chunk| {
        for line in chunk.lines() {
          debug!("build> {line}");
        }
      },
      |chunk| {
        for line in chunk.lines() {
          debug!("build> {line}");
        }
      },
    )
    .await
    .with_context(|| {
      format!(
        "Transport failure on {} running the image build",
        manager.name()
      )
    })?;
  if !output.success() {
    return Err(
      build_failure_report(manager, &scratch, &tag, &output.stderr)
        .await,
    );
  }

  // The build must actually have produced the tag.
  if !manager.image_exists(&tag).await? {
    return Err(anyhow!(
      "build reported success but image {tag} does not exist on {}",
      manager.name()
    ));
  }

  hooks::run_hooks(
    "post-build",
    &service.hooks.post_build,
    &service.env,
  )
  .await?;

  Ok(tag)
}

/// Replays the build surroundings so the error carries everything
/// needed to debug without shelling in: the context listing, the
/// Dockerfile, and whether any image landed.
async fn build_failure_report(
  manager: &DockerHost,
  scratch: &str,
  tag: &str,
  stderr: &str,
) -> anyhow::Error {
  let mut report = format!("docker build failed:\n{stderr}");

  if let Ok(listing) =
    manager.exec(format!("ls -la '{scratch}'")).await
  {
    report.push_str(&format!(
      "\n\nbuild context on manager:\n{}",
      listing.stdout.trim()
    ));
  }
  if let Ok(dockerfile) = manager
    .exec(format!("cat '{scratch}/Dockerfile' 2>/dev/null"))
    .await
    && !dockerfile.stdout.trim().is_empty()
  {
    report.push_str(&format!(
      "\n\nDockerfile:\n{}",
      dockerfile.stdout.trim()
    ));
  }
  if let Ok(exists) = manager.image_exists(tag).await {
    report.push_str(&format!(
      "\n\nimage {tag} present after failure: {exists}"
    ));
  }

  anyhow!(report)
}
