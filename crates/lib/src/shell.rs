//! Shell command execution for rule implementations.
//!
//! Commands run through the platform's plain shell with a stable locale and
//! timestamp epoch layered over the inherited environment. Rule-specified
//! variables are applied last.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus};

use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug)]
pub struct ShellOutput {
  pub status: ExitStatus,
  pub stdout: String,
  pub stderr: String,
}

impl ShellOutput {
  pub fn success(&self) -> bool {
    self.status.success()
  }

  /// Exit status for error messages.
  pub fn describe_status(&self) -> String {
    match self.status.code() {
      Some(code) => format!("exit code {code}"),
      None => "terminated by signal".to_string(),
    }
  }
}

/// Run `cmd` in `cwd` and capture its output.
pub fn run(cmd: &str, cwd: &Path, env: &BTreeMap<String, String>) -> io::Result<ShellOutput> {
  let (shell, flag) = get_shell();
  debug!(cmd = %cmd, cwd = %cwd.display(), "running command");

  let output = Command::new(shell)
    .arg(flag)
    .arg(cmd)
    .current_dir(cwd)
    .env("LANG", "C")
    .env("LC_ALL", "C")
    // 1980-01-01, the ZIP epoch
    .env("SOURCE_DATE_EPOCH", "315532800")
    .envs(env)
    .output()?;

  let result = ShellOutput {
    status: output.status,
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
  };
  if !result.success() && !result.stderr.is_empty() {
    debug!(stderr = %result.stderr, "command stderr");
  }
  Ok(result)
}

/// Always the plain system shell, never `$SHELL`, so user profiles are not
/// sourced.
fn get_shell() -> (&'static str, &'static str) {
  #[cfg(unix)]
  {
    ("/bin/sh", "-c")
  }

  #[cfg(windows)]
  {
    ("cmd.exe", "/C")
  }
}
