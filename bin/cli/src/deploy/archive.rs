use std::path::Path;

use anyhow::Context;
use flate2::{Compression, write::GzEncoder};

/// Never shipped to the build host, ignore files or not.
const SENSITIVE_EXCLUSIONS: &[&str] = &[
  ".git",
  ".env",
  ".env.*",
  "*.pem",
  "*.key",
  "id_rsa",
  "id_rsa.*",
  "id_ed25519",
  "id_ed25519.*",
  ".ssh",
  ".aws",
];

/// Packs a build context into a gzipped tar. Entry names always use
/// forward slashes so archives built on any operator OS extract the
/// same way on the Linux build host. Honors `.dockerignore` (or
/// `.takoignore`) and adds the default sensitive exclusions.
pub fn pack_context(context: &Path) -> anyhow::Result<Vec<u8>> {
  let ignore = load_ignore_patterns(context);
  let patterns: Vec<String> = SENSITIVE_EXCLUSIONS
    .iter()
    .map(|p| p.to_string())
    .chain(ignore)
    .collect();
  let compiled = patterns
    .iter()
    .filter_map(|p| wildcard::Wildcard::new(p.as_bytes()).ok())
    .collect::<Vec<_>>();

  let encoder =
    GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  add_dir(&mut builder, context, "", &compiled)?;
  let encoder = builder
    .into_inner()
    .context("Failed to finalize context archive")?;
  encoder
    .finish()
    .context("Failed to compress context archive")
}

fn add_dir(
  builder: &mut tar::Builder<GzEncoder<Vec<u8>>>,
  dir: &Path,
  prefix: &str,
  patterns: &[wildcard::Wildcard],
) -> anyhow::Result<()> {
  let mut entries = std::fs::read_dir(dir)
    .with_context(|| {
      format!("Failed to read context directory {}", dir.display())
    })?
    .collect::<Result<Vec<_>, _>>()
    .context("Failed to read context directory entry")?;
  // Stable archive contents independent of filesystem order.
  entries.sort_by_key(|e| e.file_name());

  for entry in entries {
    let file_name = entry.file_name();
    let Some(name) = file_name.to_str() else {
      continue;
    };
    let rel = if prefix.is_empty() {
      name.to_string()
    } else {
      format!("{prefix}/{name}")
    };
    if is_excluded(&rel, patterns) {
      continue;
    }
    let path = entry.path();
    let file_type = entry
      .file_type()
      .context("Failed to stat context entry")?;
    if file_type.is_dir() {
      add_dir(builder, &path, &rel, patterns)?;
    } else if file_type.is_file() {
      builder
        .append_path_with_name(&path, &rel)
        .with_context(|| {
          format!("Failed to archive {}", path.display())
        })?;
    }
    // Symlinks and specials are dropped from the archive.
  }
  Ok(())
}

/// A pattern excludes an entry when it matches the full relative
/// path or any single path component.
fn is_excluded(
  rel: &str,
  patterns: &[wildcard::Wildcard],
) -> bool {
  patterns.iter().any(|pattern| {
    pattern.is_match(rel.as_bytes())
      || rel
        .split('/')
        .any(|component| pattern.is_match(component.as_bytes()))
  })
}

fn load_ignore_patterns(context: &Path) -> Vec<String> {
  for file in [".dockerignore", ".takoignore"] {
    let Ok(contents) =
      std::fs::read_to_string(context.join(file))
    else {
      continue;
    };
    return contents
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty() && !line.starts_with('#'))
      .map(str::to_string)
      .collect();
  }
  Vec::new()
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;

  fn entry_names(bytes: &[u8]) -> Vec<String> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive
      .entries()
      .unwrap()
      .map(|entry| {
        entry
          .unwrap()
          .path()
          .unwrap()
          .to_string_lossy()
          .into_owned()
      })
      .collect()
  }

  #[test]
  fn packs_nested_files_with_forward_slashes() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("Dockerfile"), "FROM scratch")
      .unwrap();
    fs::write(dir.path().join("src/main.rs"), "fn main() {}")
      .unwrap();
    let names =
      entry_names(&pack_context(dir.path()).unwrap());
    assert!(names.contains(&String::from("Dockerfile")));
    assert!(names.contains(&String::from("src/main.rs")));
  }

  #[test]
  fn sensitive_files_are_always_excluded() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join(".git")).unwrap();
    fs::write(dir.path().join(".git/config"), "secrets").unwrap();
    fs::write(dir.path().join(".env"), "KEY=1").unwrap();
    fs::write(dir.path().join("server.pem"), "---").unwrap();
    fs::write(dir.path().join("app.py"), "print()").unwrap();
    let names =
      entry_names(&pack_context(dir.path()).unwrap());
    assert_eq!(names, ["app.py"]);
  }

  #[test]
  fn ignore_file_patterns_apply() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
      dir.path().join(".dockerignore"),
      "# deps\nnode_modules\n*.log\n",
    )
    .unwrap();
    fs::create_dir(dir.path().join("node_modules")).unwrap();
    fs::write(dir.path().join("node_modules/x.js"), "x").unwrap();
    fs::write(dir.path().join("debug.log"), "log").unwrap();
    fs::write(dir.path().join("index.js"), "x").unwrap();
    let names =
      entry_names(&pack_context(dir.path()).unwrap());
    assert!(names.contains(&String::from("index.js")));
    assert!(names.contains(&String::from(".dockerignore")));
    assert!(!names.iter().any(|n| n.contains("node_modules")));
    assert!(!names.contains(&String::from("debug.log")));
  }
}
