use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use ssh::SshClient;

use super::read_remote_file;

/// Worker reads run at most this many SSH sessions at once.
const QUERY_CONCURRENCY: usize = 5;

/// Hard deadline on recovery reads.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Reads `path` from every worker in parallel and returns the raw
/// copies that exist. No quorum, no voting: callers pick a winner.
pub async fn recover_file_from_workers(
  workers: &[Arc<SshClient>],
  path: &str,
) -> Vec<Vec<u8>> {
  let reads = futures_util::stream::iter(workers.iter().map(
    |worker| async move {
      match tokio::time::timeout(
        RECOVERY_TIMEOUT,
        read_remote_file(worker, path),
      )
      .await
      {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
          warn!(
            "recovery read of {path} from {} failed | {e:#}",
            worker.host()
          );
          None
        }
        Err(_) => {
          warn!(
            "recovery read of {path} from {} timed out",
            worker.host()
          );
          None
        }
      }
    },
  ))
  .buffer_unordered(QUERY_CONCURRENCY)
  .collect::<Vec<_>>()
  .await;
  reads.into_iter().flatten().collect()
}

/// As above, parsing each copy and dropping ones that fail to parse.
pub async fn recover_parsed_from_workers<T: DeserializeOwned>(
  workers: &[Arc<SshClient>],
  path: &str,
) -> Vec<T> {
  recover_file_from_workers(workers, path)
    .await
    .into_iter()
    .filter_map(|bytes| match serde_json::from_slice(&bytes) {
      Ok(parsed) => Some(parsed),
      Err(e) => {
        warn!("discarding unparseable worker copy of {path} | {e}");
        None
      }
    })
    .collect()
}
