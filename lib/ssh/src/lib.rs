//! # Tako SSH
//!
//! Pooled, authenticated command execution and file upload against
//! remote hosts. The transport is the only path to a target server:
//! there is no agent on the other side, just a shell and a container
//! runtime.

mod client;
mod error;
pub mod known_hosts;
mod pool;

pub use client::{
  ConnectParams, RemoteSession, SessionEvent, SshClient, SshOutput,
};
pub use error::SshError;
pub use known_hosts::{HostKeyPolicy, KnownHosts};
pub use pool::SshPool;
