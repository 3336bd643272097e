use anyhow::anyhow;

use crate::docker::DockerHost;

/// Who is listening on a host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOccupant {
  Free,
  /// One of our own replicas, matched by canonical-name prefix.
  OwnService(String),
  /// Some other runtime container.
  ForeignContainer(String),
  /// A plain host process outside the runtime.
  HostProcess(String),
}

/// Two probes: the runtime's publish filter first, then the host's
/// socket table for non-container listeners.
pub async fn identify_occupant(
  host: &DockerHost,
  port: u16,
  own_prefix: &str,
) -> anyhow::Result<PortOccupant> {
  let output = host
    .exec(format!(
      "docker ps --filter publish={port} --format '{{{{.Names}}}}'"
    ))
    .await?;
  if output.success() {
    if let Some(name) =
      output.stdout.lines().map(str::trim).find(|l| !l.is_empty())
    {
      return Ok(if name.starts_with(own_prefix) {
        PortOccupant::OwnService(name.to_string())
      } else {
        PortOccupant::ForeignContainer(name.to_string())
      });
    }
  }

  let output = host
    .exec(format!(
      "ss -ltnp 'sport = :{port}' 2>/dev/null | tail -n +2"
    ))
    .await?;
  let listener = output
    .stdout
    .lines()
    .map(str::trim)
    .find(|l| !l.is_empty());
  if let Some(line) = listener {
    return Ok(PortOccupant::HostProcess(line.to_string()));
  }

  Ok(PortOccupant::Free)
}

/// Resolves a conflict on a replica's host port. Our own replicas
/// are the normal blue-green case and pass through; a foreign
/// container is evicted; a host process is not ours to kill.
pub async fn resolve_conflict(
  host: &DockerHost,
  port: u16,
  own_prefix: &str,
) -> anyhow::Result<()> {
  match identify_occupant(host, port, own_prefix).await? {
    PortOccupant::Free | PortOccupant::OwnService(_) => Ok(()),
    PortOccupant::ForeignContainer(name) => {
      warn!(
        "port {port} on {} held by foreign container {name}, evicting",
        host.name()
      );
      host.stop_container(&name, 10).await?;
      host.remove_container(&name).await?;
      Ok(())
    }
    PortOccupant::HostProcess(desc) => Err(anyhow!(
      "port {port} on {} is held by a host process outside the container runtime: {desc}\n\
       Stop the process or change the service port.",
      host.name()
    )),
  }
}
