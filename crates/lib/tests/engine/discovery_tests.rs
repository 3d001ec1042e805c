use rivet_lib::execute::BuildError;

use super::common::Repo;

/// `config.txt` names the file to copy; the rule cannot know its
/// dependencies before it has run once.
const CONFIGURED: &str = r#"
rivet.rule{
  name = "pick",
  outs = { "out.txt" },
  impl = function(ctx)
    ctx:input("config.txt")
    local name = (ctx:input_sh("cat config.txt"):gsub("%s+$", ""))
    ctx:add_deps({ name })
    ctx:sh("cp " .. name .. " out.txt")
  end,
}
"#;

fn repo() -> Repo {
  let repo = Repo::new(CONFIGURED);
  repo.write("x.txt", "from x\n");
  repo.write("y.txt", "from y\n");
  repo.write("config.txt", "x.txt\n");
  repo
}

#[test]
fn unknown_dependencies_are_discovered_once() {
  let repo = repo();
  let report = repo.build(":pick");
  assert_eq!(report.discovery_runs, 1);
  assert_eq!(report.sandboxed_runs, 1);
  assert_eq!(repo.read("out.txt"), "from x\n");
}

#[test]
fn discovered_dependencies_are_remembered() {
  let repo = repo();
  repo.build(":pick");
  let report = repo.build(":pick");
  assert_eq!(report.discovery_runs, 0);
  assert_eq!(report.sandboxed_runs, 0);
  assert_eq!(report.cache_hits, 1);
}

#[test]
fn changing_the_configuration_rediscovers() {
  let repo = repo();
  repo.build(":pick");

  repo.write("config.txt", "y.txt\n");
  let report = repo.build(":pick");
  assert_eq!(report.discovery_runs, 1);
  assert_eq!(report.sandboxed_runs, 1);
  assert_eq!(repo.read("out.txt"), "from y\n");
}

#[test]
fn changing_a_discovered_dependency_rebuilds_without_discovery() {
  let repo = repo();
  repo.build(":pick");

  repo.write("x.txt", "new x\n");
  let report = repo.build(":pick");
  assert_eq!(report.discovery_runs, 0);
  assert_eq!(report.sandboxed_runs, 1);
  assert_eq!(repo.read("out.txt"), "new x\n");
}

#[test]
fn nondeterministic_shell_input_is_an_internal_error() {
  // Each shell has its own pid, so the sandboxed run reads something else.
  let repo = Repo::new(
    r#"
rivet.rule{
  name = "stamp",
  outs = { "stamp.txt" },
  impl = function(ctx)
    ctx:input_sh("echo $$")
    ctx:sh("echo stamped > stamp.txt")
  end,
}
"#,
  );
  let err = repo.build_with(":stamp", 1).unwrap_err();
  assert!(err.is_internal(), "unexpected error: {err}");
  assert!(matches!(err, BuildError::Internal(_)));
  assert!(err.to_string().contains(":stamp"));
}
