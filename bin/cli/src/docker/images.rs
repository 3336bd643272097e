use anyhow::Context;

use super::{DockerHost, is_not_found};

impl DockerHost {
  /// Works for both tags and ids, full or truncated.
  pub async fn image_exists(
    &self,
    reference: &str,
  ) -> anyhow::Result<bool> {
    let output = self
      .exec(format!(
        "docker image inspect --format '{{{{.Id}}}}' {reference}"
      ))
      .await?;
    if output.success() {
      Ok(true)
    } else if is_not_found(&output) {
      Ok(false)
    } else {
      Err(anyhow::anyhow!("{}", output.stderr.trim())).context(
        format!(
          "Failed to inspect image {reference} on {}",
          self.name()
        ),
      )
    }
  }

  /// The full image id behind a tag, if present on the host.
  pub async fn image_id(
    &self,
    reference: &str,
  ) -> anyhow::Result<Option<String>> {
    let output = self
      .exec(format!(
        "docker image inspect --format '{{{{.Id}}}}' {reference}"
      ))
      .await?;
    if output.success() {
      Ok(Some(output.stdout_trimmed()))
    } else {
      Ok(None)
    }
  }

  /// The command whose stdout streams the image archive.
  pub fn image_save_command(reference: &str) -> String {
    format!("docker save {reference}")
  }

  /// The command whose stdin accepts the image archive.
  pub fn image_load_command() -> String {
    String::from("docker load")
  }
}
