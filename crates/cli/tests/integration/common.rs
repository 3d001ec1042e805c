//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated repository.
///
/// Each test gets its own temporary directory holding a `WORKSPACE.lua`, so
/// caches and setup records never leak between tests.
pub struct TestRepo {
  pub temp: TempDir,
}

impl TestRepo {
  /// A repository with the given `WORKSPACE.lua` and root `BUILD.lua`.
  pub fn new(workspace: &str, build: &str) -> Self {
    let repo = Self {
      temp: TempDir::new().unwrap(),
    };
    repo.write_file("WORKSPACE.lua", workspace);
    repo.write_file("BUILD.lua", build);
    repo
  }

  pub fn root(&self) -> PathBuf {
    dunce::canonicalize(self.temp.path()).unwrap()
  }

  /// Write a file relative to the repository root.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn read_file(&self, relative_path: &str) -> String {
    std::fs::read_to_string(self.temp.path().join(relative_path)).unwrap()
  }

  /// A `rivet` command running at the repository root.
  pub fn rivet(&self) -> Command {
    self.rivet_in(Path::new(""))
  }

  /// A `rivet` command running in a subdirectory.
  pub fn rivet_in(&self, dir: &Path) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("rivet");
    cmd.current_dir(self.root().join(dir));
    cmd.env_remove("RUST_LOG");
    cmd
  }
}

/// A rule copying `a.txt` to `b.txt`.
pub const COPY_BUILD: &str = r#"
rivet.rule{
  name = "copy",
  deps = { "a.txt" },
  outs = { "b.txt" },
  impl = function(ctx)
    ctx:sh("cp a.txt b.txt")
  end,
}
"#;
