use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
  SshError,
  client::{ConnectParams, SshClient},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
  user: String,
  host: String,
  port: u16,
}

impl From<&ConnectParams> for PoolKey {
  fn from(params: &ConnectParams) -> PoolKey {
    PoolKey {
      user: params.user.clone(),
      host: params.host.clone(),
      port: params.port,
    }
  }
}

/// Connections pooled by (user, host, port). Entries are probed with
/// a cheap keepalive command before reuse; stale ones are evicted and
/// replaced. Concurrent callers share one connection per host and
/// open independent sessions over it.
#[derive(Default)]
pub struct SshPool {
  clients: RwLock<HashMap<PoolKey, Arc<SshClient>>>,
}

impl SshPool {
  pub fn new() -> SshPool {
    Default::default()
  }

  pub async fn client(
    &self,
    params: ConnectParams,
  ) -> Result<Arc<SshClient>, SshError> {
    let key = PoolKey::from(&params);

    // Fast path: health-check under the read lock.
    let existing =
      { self.clients.read().await.get(&key).cloned() };
    if let Some(client) = existing {
      if client.probe().await {
        return Ok(client);
      }
      // Re-validate under the write lock before replacement.
      // Another caller may have swapped in a fresh connection.
      let mut clients = self.clients.write().await;
      if let Some(client) = clients.get(&key).cloned() {
        if client.probe().await {
          return Ok(client);
        }
        debug!(
          "evicting stale connection to {}@{}:{}",
          key.user, key.host, key.port
        );
        clients.remove(&key);
        client.close().await;
      }
    }

    let client = Arc::new(SshClient::connect(params).await?);
    let mut clients = self.clients.write().await;
    let entry =
      clients.entry(key).or_insert_with(|| client.clone());
    Ok(entry.clone())
  }

  /// Releases every pooled connection.
  pub async fn close_all(&self) {
    let clients = {
      let mut clients = self.clients.write().await;
      std::mem::take(&mut *clients)
    };
    for client in clients.into_values() {
      client.close().await;
    }
  }
}
