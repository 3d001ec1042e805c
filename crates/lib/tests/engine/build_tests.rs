use rivet_lib::context::ContextError;
use rivet_lib::execute::BuildError;
use rivet_lib::graph::GraphError;
use rivet_lib::lua::LoadError;

use super::common::{COPY, Repo};

#[test]
fn second_build_is_a_cache_hit() {
  let repo = Repo::new(COPY);
  repo.write("a.txt", "hello\n");

  let first = repo.build(":copy");
  assert_eq!(first.sandboxed_runs, 1);
  assert_eq!(first.cache_hits, 0);
  assert_eq!(first.cache.hits, 0);
  assert_eq!(repo.read("b.txt"), "hello\n");

  let second = repo.build(":copy");
  assert_eq!(second.cache_hits, 1);
  assert_eq!(second.cache.hits, 1);
  assert_eq!(second.sandboxed_runs, 0);
  assert_eq!(second.executed(), 0);
  assert_eq!(first.keys, second.keys);
}

#[test]
fn deleted_outputs_come_back_from_the_cache() {
  let repo = Repo::new(COPY);
  repo.write("a.txt", "hello\n");
  repo.build(":copy");

  std::fs::remove_file(repo.path("b.txt")).unwrap();
  let report = repo.build(":copy");
  assert_eq!(report.cache_hits, 1);
  assert_eq!(repo.read("b.txt"), "hello\n");
}

#[test]
fn reverting_an_input_restores_the_old_key() {
  let repo = Repo::new(COPY);
  repo.write("a.txt", "one\n");
  let original = repo.build(":copy");

  repo.write("a.txt", "two\n");
  let changed = repo.build(":copy");
  assert_eq!(changed.sandboxed_runs, 1);
  assert_ne!(changed.keys, original.keys);
  assert_eq!(repo.read("b.txt"), "two\n");

  repo.write("a.txt", "one\n");
  let reverted = repo.build(":copy");
  assert_eq!(reverted.cache_hits, 1);
  assert_eq!(reverted.keys, original.keys);
  assert_eq!(repo.read("b.txt"), "one\n");
}

const DIAMOND: &str = r#"
rivet.rule{ name = "a", outs = { "a.out" }, impl = function(ctx)
  ctx:sh("echo a > a.out")
end }
rivet.rule{ name = "b", deps = { "a.out" }, outs = { "b.out" }, impl = function(ctx)
  ctx:sh("cat a.out > b.out && echo b >> b.out")
end }
rivet.rule{ name = "c", deps = { "a.out" }, outs = { "c.out" }, impl = function(ctx)
  ctx:sh("cat a.out > c.out && echo c >> c.out")
end }
rivet.rule{ name = "d", deps = { "b.out", "c.out" }, outs = { "d.out" }, impl = function(ctx)
  ctx:sh("cat b.out c.out > d.out")
end }
"#;

#[test]
fn diamond_builds_each_rule_once() {
  let parallel = Repo::new(DIAMOND);
  let report = parallel.build_with(":d", 4).unwrap();
  assert_eq!(report.keys.len(), 4);
  assert_eq!(report.sandboxed_runs, 4);
  assert_eq!(report.cache_hits, 0);
  assert_eq!(parallel.read("d.out"), "a\nb\na\nc\n");

  let serial = Repo::new(DIAMOND);
  let single = serial.build_with(":d", 1).unwrap();
  assert_eq!(single.keys, report.keys);
  assert_eq!(serial.read("d.out"), parallel.read("d.out"));
}

#[test]
fn provider_values_reach_dependents() {
  let repo = Repo::new(
    r#"
    rivet.rule{ name = "version", outs = { "v.txt" }, impl = function(ctx)
      ctx:sh("echo 1.2 > v.txt")
      return { major = 1, minor = 2 }
    end }
    rivet.rule{ name = "banner", outs = { "banner.txt" }, impl = function(ctx)
      local v = ctx:value(":version")
      ctx:sh("echo release " .. v.major .. "." .. v.minor .. " > banner.txt")
    end }
  "#,
  );
  let report = repo.build(":banner");
  assert_eq!(report.keys.len(), 2);
  assert_eq!(repo.read("banner.txt"), "release 1.2\n");
}

#[test]
fn overlapping_outputs_are_rejected_at_load() {
  let repo = Repo::new(
    r#"
    rivet.rule{ name = "tree", outs = { "gen/" }, impl = function(ctx) end }
    rivet.rule{ name = "leaf", outs = { "gen/x.txt" }, impl = function(ctx) end }
  "#,
  );
  let err = repo.build_with(":leaf", 1).unwrap_err();
  assert!(matches!(
    err,
    BuildError::Load(LoadError::Graph(GraphError::OverlappingOutputs { .. }))
  ));
  assert!(!err.is_internal());
}

#[test]
fn undeclared_inputs_fail_in_the_sandbox() {
  let repo = Repo::new(
    r#"
    rivet.rule{ name = "sneaky", outs = { "out.txt" }, impl = function(ctx)
      ctx:sh("cat secret.txt > out.txt")
    end }
  "#,
  );
  repo.write("secret.txt", "psst\n");
  let err = repo.build_with(":sneaky", 1).unwrap_err();
  match err {
    BuildError::Rule { rule, source } => {
      assert_eq!(rule, ":sneaky");
      assert!(matches!(source, ContextError::UnderDeclared { .. }));
    }
    other => panic!("expected a rule error, got {other}"),
  }
  assert!(!repo.path("out.txt").exists());
}

#[test]
fn failing_dependency_stops_the_build() {
  let repo = Repo::new(
    r#"
    rivet.rule{ name = "broken", outs = { "x.txt" }, impl = function(ctx)
      error("no toolchain configured")
    end }
    rivet.rule{ name = "top", deps = { "x.txt" }, outs = { "y.txt" }, impl = function(ctx)
      ctx:sh("cp x.txt y.txt")
    end }
  "#,
  );
  let err = repo.build_with(":top", 4).unwrap_err();
  assert!(matches!(err, BuildError::Rule { ref rule, .. } if rule == ":broken"));
  assert!(err.to_string().contains("no toolchain configured"));
}

#[test]
fn globs_ignore_outputs_left_in_the_tree() {
  let repo = Repo::new(
    r#"
rivet.rule{
  name = "bundle",
  deps = { rivet.glob("*.txt") },
  outs = { "bundle.txt" },
  impl = function(ctx)
    ctx:sh("cat a.txt b.txt > bundle.txt")
  end,
}
"#,
  );
  repo.write("a.txt", "a\n");
  repo.write("b.txt", "b\n");

  let first = repo.build(":bundle");
  assert_eq!(first.sandboxed_runs, 1);
  assert_eq!(repo.read("bundle.txt"), "a\nb\n");

  let second = repo.build(":bundle");
  assert_eq!(second.cache_hits, 1);
  assert_eq!(second.sandboxed_runs, 0);
  assert_eq!(first.keys, second.keys);
}
