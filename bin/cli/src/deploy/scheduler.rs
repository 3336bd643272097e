use anyhow::anyhow;
use config::Service;
use futures_util::{StreamExt, future::BoxFuture};
use indexmap::IndexMap;

/// Groups services into layers by dependency depth. A service's
/// same-project imports must land in earlier layers; cross-project
/// imports impose no ordering here (the other project deploys on
/// its own cadence).
pub fn layer_services(
  project: &str,
  services: &IndexMap<String, Service>,
) -> anyhow::Result<Vec<Vec<String>>> {
  let mut depths: IndexMap<&str, usize> = IndexMap::new();

  // Iterative relaxation; more passes than services means a cycle.
  for _ in 0..=services.len() {
    let mut changed = false;
    for (name, service) in services {
      let mut depth = 0;
      for import in &service.imports {
        let Some((import_project, import_service)) =
          import.split_once('.')
        else {
          continue;
        };
        if import_project != project
          || !services.contains_key(import_service)
        {
          continue;
        }
        if import_service == name {
          return Err(anyhow!(
            "service '{name}' imports itself"
          ));
        }
        depth = depth
          .max(depths.get(import_service).copied().unwrap_or(0) + 1);
      }
      if depths.get(name.as_str()).copied() != Some(depth) {
        depths.insert(name, depth);
        changed = true;
      }
    }
    if !changed {
      let max_depth =
        depths.values().copied().max().unwrap_or(0);
      let mut layers = vec![Vec::new(); max_depth + 1];
      for (name, depth) in depths {
        layers[depth].push(name.to_string());
      }
      layers.retain(|layer| !layer.is_empty());
      return Ok(layers);
    }
  }
  Err(anyhow!(
    "service imports form a cycle within project '{project}'"
  ))
}

/// Runs a task per service, layer by layer: parallel within a layer
/// up to `concurrency`, strictly sequential across layers. The
/// first error aborts unstarted peers in the layer and every
/// subsequent layer.
pub async fn run_layers<'a, T: Send + 'a>(
  layers: &'a [Vec<String>],
  concurrency: usize,
  task: impl Fn(&'a str) -> BoxFuture<'a, anyhow::Result<(String, T)>>,
) -> anyhow::Result<IndexMap<String, T>> {
  let mut results = IndexMap::new();
  for layer in layers {
    let mut stream = futures_util::stream::iter(
      layer.iter().map(|name| task(name)),
    )
    .buffer_unordered(concurrency.max(1));
    while let Some(result) = stream.next().await {
      let (name, value) = result?;
      results.insert(name, value);
    }
  }
  Ok(results)
}

#[cfg(test)]
mod tests {
  use futures_util::FutureExt;

  use super::*;

  fn service(imports: &[&str]) -> Service {
    Service {
      image: String::from("img"),
      imports: imports.iter().map(|s| s.to_string()).collect(),
      ..Default::default()
    }
  }

  fn services(
    entries: &[(&str, &[&str])],
  ) -> IndexMap<String, Service> {
    entries
      .iter()
      .map(|(name, imports)| {
        (name.to_string(), service(imports))
      })
      .collect()
  }

  #[test]
  fn independent_services_share_a_layer() {
    let layers = layer_services(
      "demo",
      &services(&[("api", &[]), ("worker", &[])]),
    )
    .unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].len(), 2);
  }

  #[test]
  fn imports_order_layers_by_depth() {
    let layers = layer_services(
      "demo",
      &services(&[
        ("web", &["demo.api"]),
        ("api", &["demo.db"]),
        ("db", &[]),
      ]),
    )
    .unwrap();
    assert_eq!(
      layers,
      [vec!["db"], vec!["api"], vec!["web"]]
        .map(|l| l
          .into_iter()
          .map(String::from)
          .collect::<Vec<_>>())
    );
  }

  #[test]
  fn cross_project_imports_impose_no_ordering() {
    let layers = layer_services(
      "demo",
      &services(&[("api", &["other.db"]), ("db", &[])]),
    )
    .unwrap();
    assert_eq!(layers.len(), 1);
  }

  #[test]
  fn cycles_are_rejected() {
    assert!(
      layer_services(
        "demo",
        &services(&[
          ("a", &["demo.b"]),
          ("b", &["demo.a"])
        ]),
      )
      .is_err()
    );
  }

  #[tokio::test]
  async fn layer_error_skips_later_layers() {
    let layers = vec![
      vec![String::from("db")],
      vec![String::from("api")],
    ];
    let result = run_layers(&layers, 4, |name| {
      let name = name.to_string();
      async move {
        if name == "db" {
          Err(anyhow!("boom"))
        } else {
          panic!("later layer must not start");
        }
      }
      .boxed()
    })
    .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn results_collect_across_layers() {
    let layers = vec![
      vec![String::from("db")],
      vec![String::from("api"), String::from("web")],
    ];
    let results = run_layers(&layers, 2, |name| {
      let name = name.to_string();
      async move {
        let value = name.len();
        Ok((name, value))
      }
      .boxed()
    })
    .await
    .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results["api"], 3);
  }
}
