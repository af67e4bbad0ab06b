use std::{
  path::{Path, PathBuf},
  process::Stdio,
  sync::OnceLock,
};

mod output;

pub use output::*;
use tokio::process::Command;

fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// One executed command plus its captured output, in the shape an
/// operator would want to review after the fact.
#[derive(Debug, Clone)]
pub struct CommandLog {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

/// Commands are run directly, and cannot include '&&'
pub async fn run_standard_command_logged(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl Into<String>,
) -> CommandLog {
  let command = command.into();
  let start_ts = now_ms();
  let output = run_standard_command(&command, path).await;
  output_into_log(stage, command, start_ts, output)
}

/// Commands are wrapped in the host shell, and can include '&&'
pub async fn run_shell_command_logged(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl Into<String>,
) -> CommandLog {
  let command = command.into();
  let start_ts = now_ms();
  let output = run_shell_command(&command, path).await;
  output_into_log(stage, command, start_ts, output)
}

/// Strips full-line and end-of-line `#` comments out of a multiline
/// command block and chains the remaining lines with '&&'. Returns
/// an empty string if every line was blank or commented out.
pub fn parse_multiline_command(command: impl AsRef<str>) -> String {
  command
    .as_ref()
    .lines()
    .map(|line| match line.find('#') {
      Some(idx) => &line[..idx],
      None => line,
    })
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .collect::<Vec<_>>()
    .join(" && ")
}

/// Parses commands out of a multiline string and chains them with
/// '&&'. Returns `None` if the command is empty after parsing.
pub async fn run_multiline_command_logged(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Option<CommandLog> {
  let command = parse_multiline_command(command);
  if command.is_empty() {
    return None;
  }
  Some(run_shell_command_logged(stage, path, command).await)
}

pub enum CommandMode {
  Standard,
  Shell,
  Multiline,
}

/// Executes the command and redacts `replacers` out of the command
/// text and output before returning, so secrets (SSH passwords,
/// signature keys) never end up in a retained log.
pub async fn run_command_with_sanitization(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
  mode: CommandMode,
  replacers: &[(String, String)],
) -> Option<CommandLog> {
  let mut log = match mode {
    CommandMode::Standard => run_standard_command_logged(
      stage,
      path,
      command.as_ref().to_string(),
    )
    .await
    .into(),
    CommandMode::Shell => run_shell_command_logged(
      stage,
      path,
      command.as_ref().to_string(),
    )
    .await
    .into(),
    CommandMode::Multiline => {
      run_multiline_command_logged(stage, path, command).await
    }
  }?;

  log.command = svi::replace_in_string(&log.command, replacers);
  log.stdout = svi::replace_in_string(&log.stdout, replacers);
  log.stderr = svi::replace_in_string(&log.stderr, replacers);

  Some(log)
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> CommandLog {
  CommandLog {
    stage: stage.to_string(),
    success: output.success(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    start_ts,
    end_ts: now_ms(),
  }
}

/// Commands are run directly, and cannot include '&&'
pub async fn run_standard_command(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let lexed = if let Some(lexed) = shlex::split(command)
    && !lexed.is_empty()
  {
    lexed
  } else {
    return CommandOutput::from_err(
      std::io::Error::other("Command lexed into empty args"),
      None,
    );
  };

  let mut cmd = Command::new(&lexed[0]);

  cmd
    .args(&lexed[1..])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e, None),
    }
  }

  match cmd.spawn() {
    Ok(mut child) => {
      let pid = child.id();
      let output = child.wait_with_output().await;
      CommandOutput::from(output, pid)
    }
    Err(e) => CommandOutput::from_err(e, None),
  }
}

fn shell() -> &'static str {
  static DEFAULT_SHELL: OnceLock<String> = OnceLock::new();
  DEFAULT_SHELL.get_or_init(|| {
    if PathBuf::from("/bin/bash").exists()
      || PathBuf::from("/usr/bin/bash").exists()
    {
      String::from("bash")
    } else {
      String::from("sh")
    }
  })
}

/// Commands are wrapped in `sh -c` (or `bash -c`), and can include '&&'
pub async fn run_shell_command(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let mut cmd = Command::new(shell());

  cmd
    .args(["-c", command])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e, None),
    }
  }

  match cmd.spawn() {
    Ok(mut child) => {
      let pid = child.id();
      let output = child.wait_with_output().await;
      CommandOutput::from(output, pid)
    }
    Err(e) => CommandOutput::from_err(e, None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn multiline_strips_comments_and_blank_lines() {
    let input = "echo one # comment\n# full line comment\n\necho two";
    assert_eq!(parse_multiline_command(input), "echo one && echo two");
  }

  #[test]
  fn multiline_of_only_comments_is_empty() {
    assert_eq!(parse_multiline_command("# just a comment\n\n"), "");
  }

  #[tokio::test]
  async fn standard_command_captures_stdout() {
    let output = run_standard_command("echo hello", None).await;
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "hello");
  }

  #[tokio::test]
  async fn shell_command_supports_chaining() {
    let output = run_shell_command("echo a && echo b", None).await;
    assert!(output.success());
    assert!(output.stdout.contains("a"));
    assert!(output.stdout.contains("b"));
  }
}
