use std::{sync::Arc, time::Duration};

use aes_gcm::{
  Aes256Gcm, Key, Nonce,
  aead::{Aead, KeyInit},
};
use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use config::names;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use ssh::SshClient;

use crate::journal;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;

/// Replication of the state blob gets a tighter deadline than
/// deployment records.
const STATE_REPLICATION_TIMEOUT: Duration =
  Duration::from_secs(15);

/// Cluster topology as of the last successful join pass. Persisted
/// encrypted at rest: the worker token is a join credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmState {
  pub manager_host: String,
  pub worker_token: String,
  pub nodes: Vec<String>,
  pub last_updated: DateTime<Utc>,
}

/// `salt || nonce || ciphertext`, key derived with PBKDF2-SHA256.
pub fn encrypt_state(
  state: &SwarmState,
  passphrase: &str,
) -> anyhow::Result<Vec<u8>> {
  let plaintext = serde_json::to_vec(state)
    .context("Failed to serialize swarm state")?;
  let mut salt = [0u8; SALT_LEN];
  let mut nonce = [0u8; NONCE_LEN];
  rand::rng().fill_bytes(&mut salt);
  rand::rng().fill_bytes(&mut nonce);
  let cipher = Aes256Gcm::new(&derive_key(passphrase, &salt));
  let ciphertext = cipher
    .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
    .map_err(|_| anyhow!("Failed to encrypt swarm state"))?;
  let mut blob =
    Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
  blob.extend_from_slice(&salt);
  blob.extend_from_slice(&nonce);
  blob.extend_from_slice(&ciphertext);
  Ok(blob)
}

pub fn decrypt_state(
  blob: &[u8],
  passphrase: &str,
) -> anyhow::Result<SwarmState> {
  if blob.len() < SALT_LEN + NONCE_LEN {
    return Err(anyhow!("Swarm state blob is truncated"));
  }
  let (salt, rest) = blob.split_at(SALT_LEN);
  let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
  let cipher = Aes256Gcm::new(&derive_key(passphrase, salt));
  let plaintext = cipher
    .decrypt(Nonce::from_slice(nonce), ciphertext)
    .map_err(|_| {
      anyhow!(
        "Failed to decrypt swarm state. Wrong TAKO_STATE_KEY?"
      )
    })?;
  serde_json::from_slice(&plaintext)
    .context("Failed to parse decrypted swarm state")
}

fn derive_key(
  passphrase: &str,
  salt: &[u8],
) -> Key<Aes256Gcm> {
  let mut key = [0u8; 32];
  pbkdf2_hmac::<Sha256>(
    passphrase.as_bytes(),
    salt,
    PBKDF2_ROUNDS,
    &mut key,
  );
  key.into()
}

/// Writes the blob on the manager and replicates it to workers in
/// the background, warnings only.
pub async fn persist_state(
  project: &str,
  state: &SwarmState,
  passphrase: &str,
  manager: &SshClient,
  workers: Vec<Arc<SshClient>>,
) -> anyhow::Result<()> {
  let path = names::swarm_state_path(project);
  let blob = encrypt_state(state, passphrase)?;
  journal::write_remote_file_atomic(manager, &path, &blob)
    .await
    .context("Failed to persist swarm state on manager")?;
  replicate_state(workers, path, blob);
  Ok(())
}

fn replicate_state(
  workers: Vec<Arc<SshClient>>,
  path: String,
  blob: Vec<u8>,
) {
  if workers.is_empty() {
    return;
  }
  tokio::spawn(async move {
    let writes = workers.iter().map(|worker| {
      let path = &path;
      let blob = &blob;
      async move {
        if let Err(e) = journal::write_remote_file_atomic(
          worker, path, blob,
        )
        .await
        {
          warn!(
            "swarm state replication to {} failed | {e:#}",
            worker.host()
          );
        }
      }
    });
    if tokio::time::timeout(
      STATE_REPLICATION_TIMEOUT,
      futures_util::future::join_all(writes),
    )
    .await
    .is_err()
    {
      warn!("swarm state replication timed out");
    }
  });
}

/// Reads the blob from the manager, falling back to the first
/// worker copy that exists. Best-effort convergence, no voting.
pub async fn load_state(
  project: &str,
  passphrase: &str,
  manager: &SshClient,
  workers: &[Arc<SshClient>],
) -> anyhow::Result<Option<SwarmState>> {
  let path = names::swarm_state_path(project);
  if let Some(blob) =
    journal::read_remote_file(manager, &path).await?
  {
    return Ok(Some(decrypt_state(&blob, passphrase)?));
  }
  let copies =
    journal::recover_file_from_workers(workers, &path).await;
  for blob in copies {
    match decrypt_state(&blob, passphrase) {
      Ok(state) => return Ok(Some(state)),
      Err(e) => warn!("discarding bad swarm state copy | {e:#}"),
    }
  }
  Ok(None)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn state() -> SwarmState {
    SwarmState {
      manager_host: String::from("10.0.0.1"),
      worker_token: String::from("SWMTKN-1-secret"),
      nodes: vec![
        String::from("alpha"),
        String::from("beta"),
      ],
      last_updated: Utc::now(),
    }
  }

  #[test]
  fn encrypt_decrypt_round_trip() {
    let blob = encrypt_state(&state(), "passphrase").unwrap();
    let decrypted = decrypt_state(&blob, "passphrase").unwrap();
    assert_eq!(decrypted.worker_token, "SWMTKN-1-secret");
    assert_eq!(decrypted.nodes.len(), 2);
  }

  #[test]
  fn wrong_passphrase_fails() {
    let blob = encrypt_state(&state(), "passphrase").unwrap();
    assert!(decrypt_state(&blob, "other").is_err());
  }

  #[test]
  fn ciphertext_never_contains_token() {
    let blob = encrypt_state(&state(), "passphrase").unwrap();
    let raw = String::from_utf8_lossy(&blob);
    assert!(!raw.contains("SWMTKN"));
  }

  #[test]
  fn truncated_blob_is_rejected() {
    assert!(decrypt_state(&[0u8; 8], "passphrase").is_err());
  }
}
