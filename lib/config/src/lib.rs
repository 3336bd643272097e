//! # Tako Config
//!
//! Types for the declarative project document (services,
//! environments, servers), the canonical naming helpers, and a
//! loader that merges multiple toml / yaml / json files into the
//! final configuration object. Supports interpolating environment
//! variables with '${VAR}' syntax.

use std::path::Path;

use indexmap::IndexSet;
use serde::de::DeserializeOwned;

mod error;
mod load;
mod merge;
pub mod names;
mod types;

pub use error::Error;
pub use merge::merge_objects;
pub use types::*;

pub type Result<T> = ::core::result::Result<T, Error>;

/// Set the configuration for loading config files.
pub struct ConfigLoader<'outer, 'inner> {
  /// Paths to either files or directories
  /// to include in the final configuration.
  ///
  /// Path coming later in the array (higher index) will override
  /// configuration in earlier paths.
  pub paths: &'outer [&'inner Path],
  /// Whether to merge nested config objects.
  /// Otherwise, the object will be replaced at
  /// the top-level key by the highest priority config file
  /// in which it is specified.
  pub merge_nested: bool,
  /// Whether to extend arrays in configuration files.
  /// Otherwise, the array will be replaced at
  /// the top-level key by the highest priority config file
  /// in which it is specified.
  pub extend_array: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let ConfigLoader {
      paths,
      merge_nested,
      extend_array,
    } = self;
    let mut all_files = IndexSet::new();
    for &path in paths {
      let mut files = Vec::new();
      load::collect_config_files(&mut files, path)?;
      for path in files {
        // If the same path comes up again later on, it should be
        // removed and reinserted so it maintains higher priority.
        all_files.shift_remove(&path);
        all_files.insert(path);
      }
    }
    load::load_parse_config_files(
      &all_files.into_iter().collect::<Vec<_>>(),
      merge_nested,
      extend_array,
    )
  }
}

/// Loads, merges and validates a full project document.
pub fn load_project_config(
  paths: &[&Path],
) -> Result<ProjectConfig> {
  let config: ProjectConfig = ConfigLoader {
    paths,
    merge_nested: true,
    extend_array: false,
  }
  .load()?;
  config.validate()?;
  Ok(config)
}
