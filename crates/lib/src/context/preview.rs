use super::{ContextBase, ContextError, Env, ExecutionContext};

/// Computes a rule's cache key without executing anything.
///
/// Commands are recorded and skipped. File inputs are read from the live
/// tree. Shell inputs are answered only from the memo cache; a miss means
/// the rule's dependencies cannot be known without running it.
pub struct PreviewContext {
  base: ContextBase,
}

impl PreviewContext {
  pub fn new(base: ContextBase) -> Self {
    Self { base }
  }
}

impl ExecutionContext for PreviewContext {
  fn base(&self) -> &ContextBase {
    &self.base
  }

  fn base_mut(&mut self) -> &mut ContextBase {
    &mut self.base
  }

  fn flush(&mut self) -> Result<(), ContextError> {
    Ok(())
  }

  fn run_sh(&mut self, _cmd: &str, _env: &Env) -> Result<(), ContextError> {
    Ok(())
  }

  fn resolve_sh_input(&mut self, scope: &str, token: &str, cmd: &str, _env: &Env) -> Result<String, ContextError> {
    self
      .base
      .cache
      .fetch(scope, token)?
      .ok_or_else(|| ContextError::Unknowable {
        command: cmd.to_string(),
      })
  }
}
