use std::fs;

use config::load_project_config;

const DOCUMENT: &str = r#"
name = "demo"

[settings]
max_concurrent_builds = 2

[services.api]
image = "nginx:1.25"
replicas = 2
port = 80

[services.api.env]
LOG_LEVEL = "info"

[services.web]
image = "demo-web:latest"
imports = ["demo.api"]

[services.web.proxy]
domain = "demo.example.com"
labels = ["traefik.enable=true"]

[environments.prod]
servers = [
  { name = "alpha", host = "10.0.0.1" },
  { name = "beta", host = "10.0.0.2", port = 2222, user = "deploy" },
]
"#;

#[test]
fn loads_a_full_document() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tako.toml");
  fs::write(&path, DOCUMENT).unwrap();

  let config = load_project_config(&[path.as_path()]).unwrap();
  assert_eq!(config.name, "demo");
  assert_eq!(config.settings.max_concurrent_builds, 2);
  // Untouched settings keep their defaults.
  assert_eq!(config.settings.max_concurrent_deploys, 4);
  assert_eq!(config.settings.drain_seconds, 30);

  let api = &config.services["api"];
  assert_eq!(api.image, "nginx:1.25");
  assert_eq!(api.replica_count(), 2);
  assert_eq!(api.port, Some(80));
  assert_eq!(api.env["LOG_LEVEL"], "info");
  assert!(!api.is_public());
  assert_eq!(api.restart, "unless-stopped");

  let web = &config.services["web"];
  assert!(web.is_public());
  assert_eq!(web.imports, ["demo.api"]);

  let prod = config.environment("prod").unwrap();
  assert!(prod.is_multi_server());
  assert_eq!(prod.manager().name, "alpha");
  assert_eq!(prod.manager().port, 22);
  assert_eq!(prod.manager().user, "root");
  assert_eq!(prod.workers().len(), 1);
  assert_eq!(prod.workers()[0].port, 2222);
  assert_eq!(prod.workers()[0].user, "deploy");
}

#[test]
fn later_files_override_earlier_ones() {
  let dir = tempfile::tempdir().unwrap();
  let base = dir.path().join("tako.toml");
  let over = dir.path().join("tako.prod.toml");
  fs::write(&base, DOCUMENT).unwrap();
  fs::write(
    &over,
    "name = \"demo\"\n[services.api]\nimage = \"nginx:1.26\"\n",
  )
  .unwrap();

  let config =
    load_project_config(&[base.as_path(), over.as_path()])
      .unwrap();
  assert_eq!(config.services["api"].image, "nginx:1.26");
  // Nested merge keeps the rest of the document.
  assert!(config.services.contains_key("web"));
}

#[test]
fn env_vars_interpolate_into_the_document() {
  // Safety: test-local variable name, no concurrent reader.
  unsafe {
    std::env::set_var("TAKO_TEST_IMAGE_TAG", "9.9.9");
  }
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tako.toml");
  fs::write(
    &path,
    "name = \"demo\"\n[services.api]\nimage = \"nginx:${TAKO_TEST_IMAGE_TAG}\"\n",
  )
  .unwrap();
  let config = load_project_config(&[path.as_path()]).unwrap();
  assert_eq!(config.services["api"].image, "nginx:9.9.9");
}

#[test]
fn unknown_environment_is_an_error() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tako.toml");
  fs::write(&path, DOCUMENT).unwrap();
  let config = load_project_config(&[path.as_path()]).unwrap();
  assert!(config.environment("staging").is_err());
}

#[test]
fn empty_environment_fails_validation() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tako.toml");
  fs::write(
    &path,
    "name = \"demo\"\n[services.api]\nimage = \"nginx\"\n[environments.prod]\nservers = []\n",
  )
  .unwrap();
  assert!(load_project_config(&[path.as_path()]).is_err());
}
