use std::{
  io::Write,
  path::{Path, PathBuf},
  str::FromStr,
};

use russh::keys::{HashAlg, PublicKey};

use crate::error::SshError;

/// How to treat a host key the tool has not pinned yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
  /// Trust on first use: pin the first observed key, abort on any
  /// later mismatch.
  #[default]
  Tofu,
  /// The key must already be pinned.
  Strict,
  /// Prompt the operator before pinning.
  Ask,
  /// Skip verification entirely.
  Insecure,
}

impl FromStr for HostKeyPolicy {
  type Err = SshError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "tofu" => Ok(HostKeyPolicy::Tofu),
      "strict" => Ok(HostKeyPolicy::Strict),
      "ask" => Ok(HostKeyPolicy::Ask),
      "insecure" => Ok(HostKeyPolicy::Insecure),
      _ => Err(SshError::InvalidHostKeyMode {
        mode: s.to_string(),
      }),
    }
  }
}

/// Outcome of a host key lookup against the pinned set.
#[derive(Debug)]
pub enum Lookup {
  Trusted,
  Unknown,
  /// A key is pinned for the host but it is not the presented one.
  Changed { pinned: String },
}

/// Tool-owned known-hosts file in the standard line format:
/// `host keytype base64` with `[host]:port` for non-default ports.
#[derive(Debug, Clone)]
pub struct KnownHosts {
  pub path: PathBuf,
}

impl KnownHosts {
  pub fn new(path: impl Into<PathBuf>) -> KnownHosts {
    KnownHosts { path: path.into() }
  }

  /// `~/.tako/known_hosts`
  pub fn default_path() -> PathBuf {
    dirs::home_dir()
      .unwrap_or_else(|| PathBuf::from("."))
      .join(".tako")
      .join("known_hosts")
  }

  pub fn lookup(
    &self,
    host: &str,
    port: u16,
    presented: &PublicKey,
  ) -> Result<Lookup, SshError> {
    let contents = match std::fs::read_to_string(&self.path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        return Ok(Lookup::Unknown);
      }
      Err(e) => {
        return Err(SshError::KnownHostsRead {
          path: self.path.clone(),
          source: e,
        });
      }
    };
    let pattern = host_pattern(host, port);
    let mut changed = None;
    for line in contents.lines() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      let mut fields = line.split_whitespace();
      let (Some(entry_host), Some(algorithm), Some(blob)) =
        (fields.next(), fields.next(), fields.next())
      else {
        continue;
      };
      if entry_host != pattern {
        continue;
      }
      let Ok(pinned) =
        PublicKey::from_openssh(&format!("{algorithm} {blob}"))
      else {
        continue;
      };
      if pinned.key_data() == presented.key_data() {
        return Ok(Lookup::Trusted);
      }
      changed = Some(fingerprint(&pinned));
    }
    match changed {
      Some(pinned) => Ok(Lookup::Changed { pinned }),
      None => Ok(Lookup::Unknown),
    }
  }

  /// Appends the key under the host's pattern, creating the file
  /// (and `~/.tako`) on first use.
  pub fn pin(
    &self,
    host: &str,
    port: u16,
    key: &PublicKey,
  ) -> Result<(), SshError> {
    let write = |path: &Path| -> std::io::Result<()> {
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
      let blob = key
        .to_openssh()
        .map_err(std::io::Error::other)?;
      writeln!(file, "{} {}", host_pattern(host, port), blob)
    };
    write(&self.path).map_err(|source| SshError::KnownHostsWrite {
      path: self.path.clone(),
      source,
    })
  }
}

fn host_pattern(host: &str, port: u16) -> String {
  if port == 22 {
    host.to_string()
  } else {
    format!("[{host}]:{port}")
  }
}

pub fn fingerprint(key: &PublicKey) -> String {
  key.fingerprint(HashAlg::Sha256).to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB";
  const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgIC";

  fn store() -> (tempfile::TempDir, KnownHosts) {
    let dir = tempfile::tempdir().unwrap();
    let store = KnownHosts::new(dir.path().join("known_hosts"));
    (dir, store)
  }

  #[test]
  fn unknown_until_pinned() {
    let (_dir, store) = store();
    let key = PublicKey::from_openssh(KEY_A).unwrap();
    assert!(matches!(
      store.lookup("10.0.0.1", 22, &key).unwrap(),
      Lookup::Unknown
    ));
    store.pin("10.0.0.1", 22, &key).unwrap();
    assert!(matches!(
      store.lookup("10.0.0.1", 22, &key).unwrap(),
      Lookup::Trusted
    ));
  }

  #[test]
  fn changed_key_is_flagged() {
    let (_dir, store) = store();
    let key_a = PublicKey::from_openssh(KEY_A).unwrap();
    let key_b = PublicKey::from_openssh(KEY_B).unwrap();
    store.pin("10.0.0.1", 22, &key_a).unwrap();
    match store.lookup("10.0.0.1", 22, &key_b).unwrap() {
      Lookup::Changed { pinned } => {
        assert_eq!(pinned, fingerprint(&key_a));
      }
      other => panic!("expected Changed, got {other:?}"),
    }
  }

  #[test]
  fn non_default_ports_use_bracket_pattern() {
    let (_dir, store) = store();
    let key = PublicKey::from_openssh(KEY_A).unwrap();
    store.pin("10.0.0.1", 2222, &key).unwrap();
    let contents =
      std::fs::read_to_string(&store.path).unwrap();
    assert!(contents.starts_with("[10.0.0.1]:2222 "));
    // The same host on the default port stays unknown.
    assert!(matches!(
      store.lookup("10.0.0.1", 22, &key).unwrap(),
      Lookup::Unknown
    ));
    assert!(matches!(
      store.lookup("10.0.0.1", 2222, &key).unwrap(),
      Lookup::Trusted
    ));
  }

  #[test]
  fn policy_parses_from_env_values() {
    assert_eq!(
      "tofu".parse::<HostKeyPolicy>().unwrap(),
      HostKeyPolicy::Tofu
    );
    assert_eq!(
      "STRICT".parse::<HostKeyPolicy>().unwrap(),
      HostKeyPolicy::Strict
    );
    assert!("trust-everyone".parse::<HostKeyPolicy>().is_err());
  }
}
