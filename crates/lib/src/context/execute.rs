use tracing::debug;

use super::{ContextBase, ContextError, Env, ExecutionContext};
use crate::shell;

/// Runs a rule for real, against the live tree or inside a sandbox.
///
/// Commands are queued and flushed at every dependency or input boundary,
/// so a command never runs before the dependencies declared ahead of it are
/// confirmed ready.
pub struct ExecuteContext {
  base: ContextBase,
  sandboxed: bool,
  pending: Vec<(String, Env)>,
}

impl ExecuteContext {
  pub fn new(base: ContextBase, sandboxed: bool) -> Self {
    Self {
      base,
      sandboxed,
      pending: Vec::new(),
    }
  }

  fn run(&self, cmd: &str, env: &Env) -> Result<String, ContextError> {
    let output = shell::run(cmd, &self.base.cwd(), env).map_err(|source| ContextError::Spawn {
      command: cmd.to_string(),
      source,
    })?;
    if output.success() {
      return Ok(output.stdout);
    }
    let (command, status, stderr) = (cmd.to_string(), output.describe_status(), output.stderr);
    Err(if self.sandboxed {
      ContextError::UnderDeclared {
        command,
        status,
        stderr,
      }
    } else {
      ContextError::CommandFailed {
        command,
        status,
        stderr,
      }
    })
  }
}

impl ExecutionContext for ExecuteContext {
  fn base(&self) -> &ContextBase {
    &self.base
  }

  fn base_mut(&mut self) -> &mut ContextBase {
    &mut self.base
  }

  fn flush(&mut self) -> Result<(), ContextError> {
    for (cmd, env) in std::mem::take(&mut self.pending) {
      self.run(&cmd, &env)?;
    }
    Ok(())
  }

  fn run_sh(&mut self, cmd: &str, env: &Env) -> Result<(), ContextError> {
    self.pending.push((cmd.to_string(), env.clone()));
    Ok(())
  }

  fn resolve_sh_input(&mut self, scope: &str, token: &str, cmd: &str, env: &Env) -> Result<String, ContextError> {
    let output = self.run(cmd, env)?;
    debug!(cmd, scope, "memoizing shell input");
    self.base.cache.memorize(scope, token, &output)?;
    Ok(output)
  }
}
