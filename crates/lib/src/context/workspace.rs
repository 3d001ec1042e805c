use super::{ContextBase, ContextError, Env, ExecutionContext};
use crate::shell;

/// Runs one-time setup rules against the live tree.
///
/// Commands run as soon as they are issued. Readiness comes from the
/// bootstrap scheduler rather than the build state.
pub struct WorkspaceContext {
  base: ContextBase,
}

impl WorkspaceContext {
  pub fn new(base: ContextBase) -> Self {
    Self { base }
  }

  fn run(&self, cmd: &str, env: &Env) -> Result<String, ContextError> {
    let output = shell::run(cmd, &self.base.cwd(), env).map_err(|source| ContextError::Spawn {
      command: cmd.to_string(),
      source,
    })?;
    if !output.success() {
      return Err(ContextError::CommandFailed {
        command: cmd.to_string(),
        status: output.describe_status(),
        stderr: output.stderr,
      });
    }
    Ok(output.stdout)
  }
}

impl ExecutionContext for WorkspaceContext {
  fn base(&self) -> &ContextBase {
    &self.base
  }

  fn base_mut(&mut self) -> &mut ContextBase {
    &mut self.base
  }

  fn flush(&mut self) -> Result<(), ContextError> {
    Ok(())
  }

  fn run_sh(&mut self, cmd: &str, env: &Env) -> Result<(), ContextError> {
    self.run(cmd, env).map(drop)
  }

  fn resolve_sh_input(&mut self, scope: &str, token: &str, cmd: &str, env: &Env) -> Result<String, ContextError> {
    let output = self.run(cmd, env)?;
    self.base.cache.memorize(scope, token, &output)?;
    Ok(output)
  }
}
