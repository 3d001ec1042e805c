//! Path syntax shared by build files, rule implementations and the CLI.
//!
//! - `//a/b` is repo-absolute
//! - `:name` references a rule by name and is left untouched
//! - anything else is relative to the declaring directory
//!
//! Resolved paths are repo-relative, use `/` separators, and keep a trailing
//! `/` when they denote a directory.

use super::GraphError;

/// Whether `path` is a `:name` rule reference.
pub fn is_rule_ref(path: &str) -> bool {
  path.starts_with(':')
}

/// Whether `path` denotes a whole directory.
pub fn is_dir_path(path: &str) -> bool {
  path.ends_with('/')
}

/// Resolve `path`, written in a file that lives in `dir`, to its canonical
/// repo-relative form.
pub fn resolve(dir: &str, path: &str) -> Result<String, GraphError> {
  if is_rule_ref(path) {
    if path.len() == 1 {
      return Err(GraphError::InvalidPath {
        path: path.to_string(),
        reason: "empty rule name".to_string(),
      });
    }
    return Ok(path.to_string());
  }
  if path.is_empty() {
    return Err(GraphError::InvalidPath {
      path: path.to_string(),
      reason: "empty path".to_string(),
    });
  }

  let (base, rest) = match path.strip_prefix("//") {
    Some(rest) => ("", rest),
    None if path.starts_with('/') => {
      return Err(GraphError::InvalidPath {
        path: path.to_string(),
        reason: "filesystem-absolute paths are not allowed, use //".to_string(),
      });
    }
    None => (dir, path),
  };

  let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
  for segment in rest.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        if parts.pop().is_none() {
          return Err(GraphError::InvalidPath {
            path: path.to_string(),
            reason: "escapes the repository root".to_string(),
          });
        }
      }
      other => parts.push(other),
    }
  }

  let mut resolved = parts.join("/");
  if is_dir_path(path) && !resolved.is_empty() {
    resolved.push('/');
  }
  Ok(resolved)
}

/// Resolve a path that must name a file or directory (not a rule).
pub fn resolve_target_path(dir: &str, path: &str) -> Result<String, GraphError> {
  let resolved = resolve(dir, path)?;
  if is_rule_ref(&resolved) || resolved.is_empty() {
    return Err(GraphError::InvalidPath {
      path: path.to_string(),
      reason: "expected a file or directory path".to_string(),
    });
  }
  Ok(resolved)
}

/// The enclosing directories of `path`, innermost first, each with a
/// trailing `/`. The path itself is never included.
pub fn ancestors(path: &str) -> impl Iterator<Item = String> + '_ {
  let trimmed = path.trim_end_matches('/');
  trimmed
    .char_indices()
    .rev()
    .filter(|(_, c)| *c == '/')
    .map(move |(i, _)| trimmed[..=i].to_string())
}

/// Directory part of a repo-relative file path (`""` for the root).
pub fn parent_dir(path: &str) -> &str {
  match path.trim_end_matches('/').rfind('/') {
    Some(i) => &path[..i],
    None => "",
  }
}

/// Spell the repo-relative `target` as a path relative to directory `from`.
pub fn relative_to(from: &str, target: &str) -> String {
  let from_parts: Vec<&str> = from.split('/').filter(|p| !p.is_empty()).collect();
  let target_parts: Vec<&str> = target.split('/').filter(|p| !p.is_empty()).collect();
  let common = from_parts
    .iter()
    .zip(&target_parts)
    .take_while(|(a, b)| a == b)
    .count();

  let mut parts: Vec<&str> = vec![".."; from_parts.len() - common];
  parts.extend(&target_parts[common..]);
  let mut relative = if parts.is_empty() { ".".to_string() } else { parts.join("/") };
  if is_dir_path(target) && !relative.ends_with('/') {
    relative.push('/');
  }
  relative
}
