//! Well-known file and directory names.

/// File whose presence marks the repository root.
pub const WORKSPACE_FILE: &str = "WORKSPACE.lua";

/// Per-directory rule declarations.
pub const BUILD_FILE: &str = "BUILD.lua";

/// Engine state directory at the repository root. Never a source.
pub const STATE_DIR: &str = ".rivet";

pub const GIT_DIR: &str = ".git";

/// Local cache store, below [`STATE_DIR`].
pub const CACHE_SUBDIR: &str = "cache";

/// Local mirror of a remote cache, below [`STATE_DIR`].
pub const MIRROR_SUBDIR: &str = "mirror";

/// Bootstrap records, below [`STATE_DIR`].
pub const SETUP_SUBDIR: &str = "setup";

/// Engine version, compared against `rivet.config.require_minimum_version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
