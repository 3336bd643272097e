use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use ssh::SshClient;

use super::write_remote_file_atomic;

/// Fans the given files out to every worker in a detached task with
/// a hard deadline. Failures are warnings only: replication never
/// blocks or fails the deployment that triggered it.
pub fn replicate_files(
  workers: Vec<Arc<SshClient>>,
  files: Vec<(String, Vec<u8>)>,
  timeout: Duration,
) {
  if workers.is_empty() {
    return;
  }
  tokio::spawn(async move {
    let files = Arc::new(files);
    let writes = workers.into_iter().map(|worker| {
      let files = files.clone();
      async move {
        for (path, bytes) in files.iter() {
          if let Err(e) =
            write_remote_file_atomic(&worker, path, bytes).await
          {
            warn!(
              "journal replication to {} failed | {e:#}",
              worker.host()
            );
            return;
          }
        }
        debug!("journal replicated to {}", worker.host());
      }
    });
    if tokio::time::timeout(timeout, join_all(writes))
      .await
      .is_err()
    {
      warn!(
        "journal replication timed out after {}s",
        timeout.as_secs()
      );
    }
  });
}
