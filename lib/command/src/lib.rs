use std::path::Path;

use run_command::{CommandOutput, async_run_command};
use serde::{Deserialize, Serialize};

/// The result of one local command invocation,
/// tagged with the stage that issued it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(stage: &str, msg: String) -> Log {
    let ts = tako_timestamp();
    Log {
      stage: stage.to_string(),
      stdout: msg,
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn error(stage: &str, msg: String) -> Log {
    let ts = tako_timestamp();
    Log {
      stage: stage.to_string(),
      stderr: msg,
      success: false,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn combined(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (true, true) => String::new(),
      (false, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      (false, false) => {
        format!("stdout: {}\n\nstderr: {}", self.stdout, self.stderr)
      }
    }
  }
}

pub fn tako_timestamp() -> i64 {
  async_timing_util::unix_timestamp_ms() as i64
}

pub async fn run_tako_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = tako_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

/// Parses commands out of multiline string
/// and chains them together with '&&'.
/// Supports full line and end of line comments.
///
/// The result may be None if the command is empty after parsing,
/// ie if all the lines are commented out.
pub async fn run_tako_command_multiline(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Option<Log> {
  let command = parse_multiline_command(command);
  if command.is_empty() {
    return None;
  }
  Some(run_tako_command(stage, path, command).await)
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: tako_timestamp(),
  }
}

/// Strips comments out of a multiline command block and joins
/// the surviving lines with '&&' so they run as one shell command.
pub fn parse_multiline_command(command: impl AsRef<str>) -> String {
  command
    .as_ref()
    .lines()
    .filter_map(|line| {
      let line = match line.split_once(" #") {
        Some((command, _)) => command,
        None => line,
      }
      .trim();
      if line.is_empty() || line.starts_with('#') {
        None
      } else {
        Some(line)
      }
    })
    .collect::<Vec<_>>()
    .join(" && ")
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  logs.iter().all(|log| log.success)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn multiline_joins_with_and() {
    let parsed =
      parse_multiline_command("echo one\necho two\necho three");
    assert_eq!(parsed, "echo one && echo two && echo three");
  }

  #[test]
  fn multiline_strips_comments() {
    let parsed = parse_multiline_command(
      "# setup\necho one # inline\n\n  # full line\necho two",
    );
    assert_eq!(parsed, "echo one && echo two");
  }

  #[test]
  fn multiline_all_comments_is_empty() {
    assert!(parse_multiline_command("# a\n# b").is_empty());
  }
}
