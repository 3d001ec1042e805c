use std::path::{Path, PathBuf};

use rivet_lib::execute::{self, BuildError, BuildOptions, BuildReport, CacheLocation};
use rivet_lib::lua::Flags;
use rivet_lib::workspace::Workspace;
use tempfile::TempDir;

/// A repository with its cache kept outside the tree.
pub struct Repo {
  pub temp: TempDir,
  pub cache: TempDir,
}

impl Repo {
  pub fn new(build: &str) -> Self {
    let repo = Self {
      temp: TempDir::new().unwrap(),
      cache: TempDir::new().unwrap(),
    };
    repo.write("WORKSPACE.lua", "");
    repo.write("BUILD.lua", build);
    repo
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  pub fn write(&self, rel: &str, content: &str) {
    let path = self.temp.path().join(rel);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
  }

  pub fn read(&self, rel: &str) -> String {
    std::fs::read_to_string(self.temp.path().join(rel)).unwrap()
  }

  pub fn path(&self, rel: &str) -> PathBuf {
    self.temp.path().join(rel)
  }

  /// Load the workspace afresh and build `target`.
  pub fn build_with(&self, target: &str, threads: usize) -> Result<BuildReport, BuildError> {
    let workspace = Workspace::open(self.root(), &Flags::new())?;
    let id = workspace.resolve_target(Some(target))?;
    let options = BuildOptions {
      threads,
      cache: CacheLocation::Directory(self.cache.path().to_path_buf()),
      ..Default::default()
    };
    execute::build(&workspace, id, &options)
  }

  pub fn build(&self, target: &str) -> BuildReport {
    self.build_with(target, 2).unwrap()
  }
}

pub const COPY: &str = r#"
rivet.rule{
  name = "copy",
  deps = { "a.txt" },
  outs = { "b.txt" },
  impl = function(ctx)
    ctx:sh("cp a.txt b.txt")
  end,
}
"#;
