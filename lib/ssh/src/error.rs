use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
  #[error(
    "Failed to connect to {user}@{host}:{port} after {attempts} attempts | {source}"
  )]
  Connect {
    user: String,
    host: String,
    port: u16,
    attempts: usize,
    source: russh::Error,
  },

  #[error("Connection to {host}:{port} timed out after {seconds}s")]
  ConnectTimeout {
    host: String,
    port: u16,
    seconds: u64,
  },

  #[error(
    "WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED for {host}:{port}!\n\
     Someone could be eavesdropping on you right now (man-in-the-middle attack)!\n\
     Pinned fingerprint:    {pinned}\n\
     Presented fingerprint: {presented}\n\
     If the host key was rotated on purpose, remove the stale entry from\n\
     {path} and connect again to pin the new key."
  )]
  HostKeyMismatch {
    host: String,
    port: u16,
    pinned: String,
    presented: String,
    path: PathBuf,
  },

  #[error(
    "No pinned host key for {host}:{port} and host key mode is 'strict'.\n\
     Presented fingerprint: {presented}\n\
     Add the host to {path} out of band, or connect once with TAKO_HOST_KEY_MODE=tofu."
  )]
  HostKeyUnknown {
    host: String,
    port: u16,
    presented: String,
    path: PathBuf,
  },

  #[error("Host key for {host}:{port} rejected by operator")]
  HostKeyRejected { host: String, port: u16 },

  #[error(
    "Authentication failed for {user}@{host} | tried: {tried}.{hint}"
  )]
  Auth {
    user: String,
    host: String,
    tried: String,
    hint: String,
  },

  #[error(
    "Key at {path} is passphrase-protected and no SSH agent is reachable.\n\
     Run `ssh-add {path}` (with SSH_AUTH_SOCK set) or provide a password."
  )]
  EncryptedKeyNoAgent { path: PathBuf },

  #[error("Remote session cancelled")]
  Cancelled,

  #[error("SSH agent error | {0}")]
  Agent(String),

  #[error("Failed to upload {path} to {host} | {stderr}")]
  Upload {
    path: String,
    host: String,
    stderr: String,
  },

  #[error("Failed to read known hosts file at {path} | {source}")]
  KnownHostsRead {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("Failed to write known hosts file at {path} | {source}")]
  KnownHostsWrite {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("Invalid host key mode '{mode}' | expected tofu, strict, ask or insecure")]
  InvalidHostKeyMode { mode: String },

  #[error(transparent)]
  Protocol(#[from] russh::Error),

  #[error("SSH key error | {0}")]
  Key(#[from] russh::keys::Error),
}
