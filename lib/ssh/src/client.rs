use std::{path::PathBuf, sync::Arc, time::Duration};

use russh::{
  Channel, ChannelMsg, Disconnect, Sig,
  client::{self, AuthResult, Handle, Msg},
  keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
  SshError,
  known_hosts::{HostKeyPolicy, KnownHosts, Lookup, fingerprint},
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_BACKOFF_SECONDS: [u64; 3] = [1, 2, 4];

/// Everything needed to open an authenticated channel to one host.
#[derive(Debug, Clone)]
pub struct ConnectParams {
  pub host: String,
  pub port: u16,
  pub user: String,
  /// Explicit private key. First in the auth selection order.
  pub key_path: Option<PathBuf>,
  /// Password fallback, tried after key and agent.
  pub password: Option<String>,
  pub policy: HostKeyPolicy,
  pub known_hosts: PathBuf,
}

/// Collected output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct SshOutput {
  pub stdout: String,
  pub stderr: String,
  pub exit_status: Option<u32>,
}

impl SshOutput {
  pub fn success(&self) -> bool {
    self.exit_status == Some(0)
  }

  /// stdout with trailing whitespace trimmed, for single-value reads.
  pub fn stdout_trimmed(&self) -> String {
    self.stdout.trim().to_string()
  }
}

/// One pooled connection. Callers open independent sessions over the
/// shared protocol connection; the handle mutex is held only while a
/// channel is opened, never for the lifetime of a command.
pub struct SshClient {
  params: ConnectParams,
  handle: Mutex<Handle<TrustHandler>>,
}

impl SshClient {
  pub async fn connect(
    params: ConnectParams,
  ) -> Result<SshClient, SshError> {
    let config = Arc::new(client::Config {
      keepalive_interval: Some(KEEPALIVE_INTERVAL),
      keepalive_max: 3,
      ..Default::default()
    });

    let mut last_err = None;
    let attempts = CONNECT_BACKOFF_SECONDS.len();
    for (attempt, backoff) in
      CONNECT_BACKOFF_SECONDS.into_iter().enumerate()
    {
      match dial(config.clone(), &params).await {
        Ok(mut handle) => {
          authenticate(&mut handle, &params).await?;
          return Ok(SshClient {
            params,
            handle: Mutex::new(handle),
          });
        }
        // Host key decisions are final, retrying cannot change them.
        Err(
          e @ (SshError::HostKeyMismatch { .. }
          | SshError::HostKeyUnknown { .. }
          | SshError::HostKeyRejected { .. }),
        ) => return Err(e),
        Err(e) => {
          debug!(
            "connect attempt {} to {}:{} failed | {e:?}",
            attempt + 1,
            params.host,
            params.port
          );
          last_err = Some(e);
          if attempt + 1 < attempts {
            tokio::time::sleep(Duration::from_secs(backoff)).await;
          }
        }
      }
    }

    match last_err {
      Some(SshError::Protocol(source)) => Err(SshError::Connect {
        user: params.user,
        host: params.host,
        port: params.port,
        attempts,
        source,
      }),
      Some(e) => Err(e),
      None => unreachable!("connect loop runs at least once"),
    }
  }

  pub fn host(&self) -> &str {
    &self.params.host
  }

  /// Execute and collect output. The command itself is never retried.
  pub async fn execute(
    &self,
    command: &str,
  ) -> Result<SshOutput, SshError> {
    let mut channel = self.open_channel().await?;
    channel.exec(true, command).await?;
    let mut output = SshOutput::default();
    while let Some(msg) = channel.wait().await {
      collect_msg(&mut output, msg);
    }
    Ok(output)
  }

  /// Execute, sending a terminate signal to the remote session if the
  /// token fires first.
  pub async fn execute_cancellable(
    &self,
    command: &str,
    cancel: &CancellationToken,
  ) -> Result<SshOutput, SshError> {
    let mut channel = self.open_channel().await?;
    channel.exec(true, command).await?;
    let mut output = SshOutput::default();
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          let _ = channel.signal(Sig::TERM).await;
          return Err(SshError::Cancelled);
        }
        msg = channel.wait() => {
          let Some(msg) = msg else {
            break;
          };
          collect_msg(&mut output, msg);
        }
      }
    }
    Ok(output)
  }

  /// Execute with live stdout / stderr callbacks. Output is still
  /// collected and returned in full.
  pub async fn execute_streaming(
    &self,
    command: &str,
    mut on_stdout: impl FnMut(&str),
    mut on_stderr: impl FnMut(&str),
  ) -> Result<SshOutput, SshError> {
    let mut channel = self.open_channel().await?;
    channel.exec(true, command).await?;
    let mut output = SshOutput::default();
    while let Some(msg) = channel.wait().await {
      match &msg {
        ChannelMsg::Data { data } => {
          on_stdout(&String::from_utf8_lossy(&data[..]));
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
          on_stderr(&String::from_utf8_lossy(&data[..]));
        }
        _ => {}
      }
      collect_msg(&mut output, msg);
    }
    Ok(output)
  }

  /// Start a long-running remote command and hand the session to the
  /// caller. Used for image save / load streaming.
  pub async fn start_session(
    &self,
    command: &str,
  ) -> Result<RemoteSession, SshError> {
    let mut channel = self.open_channel().await?;
    channel.exec(true, command).await?;
    Ok(RemoteSession { channel })
  }

  /// Uploads bytes to a remote path with the given chmod mode,
  /// creating parent directories.
  pub async fn upload(
    &self,
    bytes: &[u8],
    remote_path: &str,
    mode: &str,
  ) -> Result<(), SshError> {
    let parent = match remote_path.rsplit_once('/') {
      Some((parent, _)) if !parent.is_empty() => parent,
      _ => ".",
    };
    let command = format!(
      "mkdir -p '{parent}' && cat > '{remote_path}' && chmod {mode} '{remote_path}'"
    );
    let mut channel = self.open_channel().await?;
    channel.exec(true, command.as_str()).await?;
    channel.data(bytes).await?;
    channel.eof().await?;
    let mut output = SshOutput::default();
    while let Some(msg) = channel.wait().await {
      collect_msg(&mut output, msg);
    }
    if output.success() {
      Ok(())
    } else {
      Err(SshError::Upload {
        path: remote_path.to_string(),
        host: self.params.host.clone(),
        stderr: output.stderr,
      })
    }
  }

  /// Cheap liveness check used by the pool before handing the
  /// connection out.
  pub async fn probe(&self) -> bool {
    matches!(
      tokio::time::timeout(PROBE_TIMEOUT, self.execute("true"))
        .await,
      Ok(Ok(output)) if output.success()
    )
  }

  pub async fn close(&self) {
    let handle = self.handle.lock().await;
    let _ = handle
      .disconnect(Disconnect::ByApplication, "", "en")
      .await;
  }

  async fn open_channel(
    &self,
  ) -> Result<Channel<Msg>, SshError> {
    let handle = self.handle.lock().await;
    Ok(handle.channel_open_session().await?)
  }
}

fn collect_msg(output: &mut SshOutput, msg: ChannelMsg) {
  match msg {
    ChannelMsg::Data { ref data } => {
      output
        .stdout
        .push_str(&String::from_utf8_lossy(&data[..]));
    }
    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
      output
        .stderr
        .push_str(&String::from_utf8_lossy(&data[..]));
    }
    ChannelMsg::ExitStatus { exit_status } => {
      output.exit_status = Some(exit_status);
    }
    _ => {}
  }
}

async fn dial(
  config: Arc<client::Config>,
  params: &ConnectParams,
) -> Result<Handle<TrustHandler>, SshError> {
  let handler = TrustHandler {
    host: params.host.clone(),
    port: params.port,
    policy: params.policy,
    store: KnownHosts::new(params.known_hosts.clone()),
  };
  tokio::time::timeout(
    DIAL_TIMEOUT,
    client::connect(
      config,
      (params.host.as_str(), params.port),
      handler,
    ),
  )
  .await
  .map_err(|_| SshError::ConnectTimeout {
    host: params.host.clone(),
    port: params.port,
    seconds: DIAL_TIMEOUT.as_secs(),
  })?
}

/// Auth selection order: explicit key, then agent-signed keys, then
/// password. A passphrase-protected key falls back to the agent.
async fn authenticate(
  handle: &mut Handle<TrustHandler>,
  params: &ConnectParams,
) -> Result<(), SshError> {
  use russh::keys::agent::client::AgentClient;

  let mut tried = Vec::new();
  let mut encrypted_key = None;

  if let Some(key_path) = &params.key_path {
    match load_secret_key(key_path, None) {
      Ok(key) => {
        tried.push("key");
        let hash_alg =
          handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
          .authenticate_publickey(
            &params.user,
            PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
          )
          .await?;
        if matches!(auth, AuthResult::Success) {
          return Ok(());
        }
      }
      Err(e) => {
        // Likely passphrase-protected. The agent may hold it.
        debug!(
          "could not load key at {} | {e:?}",
          key_path.display()
        );
        encrypted_key = Some(key_path.clone());
      }
    }
  }

  match AgentClient::connect_env().await {
    Ok(mut agent) => {
      tried.push("agent");
      let identities = agent
        .request_identities()
        .await
        .map_err(|e| SshError::Agent(e.to_string()))?;
      let hash_alg =
        handle.best_supported_rsa_hash().await?.flatten();
      for key in identities {
        let auth = handle
          .authenticate_publickey_with(
            &params.user,
            key,
            hash_alg,
            &mut agent,
          )
          .await
          .map_err(|e| SshError::Agent(e.to_string()))?;
        if matches!(auth, AuthResult::Success) {
          return Ok(());
        }
      }
    }
    Err(e) => {
      debug!("no ssh agent available | {e:?}");
      if let (Some(path), None) = (encrypted_key, &params.password)
      {
        return Err(SshError::EncryptedKeyNoAgent { path });
      }
    }
  }

  if let Some(password) = &params.password {
    tried.push("password");
    let auth = handle
      .authenticate_password(&params.user, password)
      .await?;
    if matches!(auth, AuthResult::Success) {
      return Ok(());
    }
  }

  let hint = if tried.is_empty() {
    " No key path, agent or password configured for this server."
  } else {
    ""
  };
  Err(SshError::Auth {
    user: params.user.clone(),
    host: params.host.clone(),
    tried: tried.join(", "),
    hint: hint.to_string(),
  })
}

/// Applies the host key policy against the tool-owned known-hosts
/// file during the handshake.
struct TrustHandler {
  host: String,
  port: u16,
  policy: HostKeyPolicy,
  store: KnownHosts,
}

impl client::Handler for TrustHandler {
  type Error = SshError;

  async fn check_server_key(
    &mut self,
    server_public_key: &PublicKey,
  ) -> Result<bool, Self::Error> {
    if self.policy == HostKeyPolicy::Insecure {
      return Ok(true);
    }
    match self.store.lookup(
      &self.host,
      self.port,
      server_public_key,
    )? {
      Lookup::Trusted => Ok(true),
      Lookup::Changed { pinned } => {
        Err(SshError::HostKeyMismatch {
          host: self.host.clone(),
          port: self.port,
          pinned,
          presented: fingerprint(server_public_key),
          path: self.store.path.clone(),
        })
      }
      Lookup::Unknown => match self.policy {
        HostKeyPolicy::Tofu => {
          self.store.pin(
            &self.host,
            self.port,
            server_public_key,
          )?;
          Ok(true)
        }
        HostKeyPolicy::Strict => Err(SshError::HostKeyUnknown {
          host: self.host.clone(),
          port: self.port,
          presented: fingerprint(server_public_key),
          path: self.store.path.clone(),
        }),
        HostKeyPolicy::Ask => {
          if prompt_accept(
            &self.host,
            self.port,
            server_public_key,
          ) {
            self.store.pin(
              &self.host,
              self.port,
              server_public_key,
            )?;
            Ok(true)
          } else {
            Err(SshError::HostKeyRejected {
              host: self.host.clone(),
              port: self.port,
            })
          }
        }
        HostKeyPolicy::Insecure => Ok(true),
      },
    }
  }
}

fn prompt_accept(host: &str, port: u16, key: &PublicKey) -> bool {
  tokio::task::block_in_place(|| {
    eprintln!(
      "The authenticity of host '{host}:{port}' can't be established."
    );
    eprintln!(
      "{} key fingerprint is {}.",
      key.algorithm(),
      fingerprint(key)
    );
    eprint!("Are you sure you want to continue connecting (yes/no)? ");
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
      return false;
    }
    line.trim().eq_ignore_ascii_case("yes")
  })
}

/// A live remote command whose streams the caller drives directly.
pub struct RemoteSession {
  channel: Channel<Msg>,
}

/// One event from a long-running session.
pub enum SessionEvent {
  Stdout(Vec<u8>),
  Stderr(Vec<u8>),
  Exit(u32),
}

impl RemoteSession {
  /// Next stream event, or None once the channel closes.
  pub async fn next(&mut self) -> Option<SessionEvent> {
    loop {
      match self.channel.wait().await? {
        ChannelMsg::Data { ref data } => {
          return Some(SessionEvent::Stdout(data.to_vec()));
        }
        ChannelMsg::ExtendedData { ref data, ext: 1 } => {
          return Some(SessionEvent::Stderr(data.to_vec()));
        }
        ChannelMsg::ExitStatus { exit_status } => {
          return Some(SessionEvent::Exit(exit_status));
        }
        _ => {}
      }
    }
  }

  pub async fn send(
    &mut self,
    bytes: &[u8],
  ) -> Result<(), SshError> {
    self.channel.data(bytes).await?;
    Ok(())
  }

  /// Signals end of stdin to the remote command.
  pub async fn finish_input(&mut self) -> Result<(), SshError> {
    self.channel.eof().await?;
    Ok(())
  }

  pub async fn terminate(&mut self) -> Result<(), SshError> {
    self.channel.signal(Sig::TERM).await?;
    Ok(())
  }
}
