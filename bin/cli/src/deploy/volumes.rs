use config::names;

/// Rewrites the source of each `source:destination[:options]` mount.
/// Named volumes become `{project}_{environment}_{source}`; bind
/// mounts (absolute paths, drive-letter paths included) pass
/// through unchanged.
pub fn scope_volumes(
  project: &str,
  environment: &str,
  volumes: &[String],
) -> Vec<String> {
  volumes
    .iter()
    .map(|volume| scope_volume(project, environment, volume))
    .collect()
}

fn scope_volume(
  project: &str,
  environment: &str,
  volume: &str,
) -> String {
  let Some((source, rest)) = split_source(volume) else {
    return volume.to_string();
  };
  format!(
    "{}:{rest}",
    names::scoped_volume_source(project, environment, source)
  )
}

/// Splits off the source, accounting for the colon inside
/// drive-letter sources like `C:\data`.
fn split_source(volume: &str) -> Option<(&str, &str)> {
  let search_from = if names::is_bind_source(volume)
    && !volume.starts_with('/')
  {
    // Skip the drive letter's colon.
    2
  } else {
    0
  };
  let idx = volume[search_from..].find(':')? + search_from;
  Some((&volume[..idx], &volume[idx + 1..]))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn named_volumes_are_scoped() {
    let scoped = scope_volumes(
      "demo",
      "prod",
      &[
        String::from("data:/var/data"),
        String::from("/etc/hosts:/etc/hosts:ro"),
      ],
    );
    assert_eq!(
      scoped,
      [
        "demo_prod_data:/var/data",
        "/etc/hosts:/etc/hosts:ro"
      ]
    );
  }

  #[test]
  fn options_survive_scoping() {
    let scoped =
      scope_volumes("demo", "prod", &[String::from("cache:/tmp/cache:rw")]);
    assert_eq!(scoped, ["demo_prod_cache:/tmp/cache:rw"]);
  }

  #[test]
  fn drive_letter_sources_pass_through() {
    let scoped = scope_volumes(
      "demo",
      "prod",
      &[String::from("C:\\data:/var/data")],
    );
    assert_eq!(scoped, ["C:\\data:/var/data"]);
  }

  #[test]
  fn sources_without_destination_are_untouched() {
    let scoped =
      scope_volumes("demo", "prod", &[String::from("lonely")]);
    assert_eq!(scoped, ["lonely"]);
  }
}
