//! Build command integration tests.

use std::path::Path;

use predicates::prelude::*;

use super::common::{COPY_BUILD, TestRepo};

fn copy_repo() -> TestRepo {
  let repo = TestRepo::new("", COPY_BUILD);
  repo.write_file("a.txt", "hello\n");
  repo
}

#[cfg(unix)]
#[test]
fn builds_a_named_target() {
  let repo = copy_repo();
  repo
    .rivet()
    .arg(":copy")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built :copy"))
    .stdout(predicate::str::contains("1 executed"));
  assert_eq!(repo.read_file("b.txt"), "hello\n");
}

#[cfg(unix)]
#[test]
fn second_build_is_cached() {
  let repo = copy_repo();
  repo.rivet().arg(":copy").assert().success();
  repo
    .rivet()
    .arg(":copy")
    .assert()
    .success()
    .stdout(predicate::str::contains("1 cached, 0 executed"));
  assert_eq!(repo.read_file("b.txt"), "hello\n");
}

#[cfg(unix)]
#[test]
fn targets_may_be_output_paths() {
  let repo = copy_repo();
  repo.rivet().arg("b.txt").assert().success();
  assert_eq!(repo.read_file("b.txt"), "hello\n");
}

#[cfg(unix)]
#[test]
fn defaults_to_the_workspace_build_rule() {
  let repo = TestRepo::new(r#"rivet.config.register_default_build_rule(":copy")"#, COPY_BUILD);
  repo.write_file("a.txt", "x");
  repo
    .rivet()
    .assert()
    .success()
    .stdout(predicate::str::contains("Built :copy"));
}

#[test]
fn no_target_and_no_default() {
  let repo = copy_repo();
  repo
    .rivet()
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("error: no target given"));
}

#[test]
fn unknown_target() {
  let repo = copy_repo();
  repo
    .rivet()
    .arg(":missing")
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("unknown target :missing"));
}

#[test]
fn outside_a_workspace() {
  let temp = tempfile::TempDir::new().unwrap();
  let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("rivet");
  cmd
    .current_dir(temp.path())
    .arg(":x")
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("no WORKSPACE.lua found"));
}

#[test]
fn overlapping_outputs_are_rejected_before_building() {
  let repo = TestRepo::new(
    "",
    r#"
      rivet.rule{ name = "dir", outs = { "gen/" }, impl = function(ctx) ctx:sh("touch ran") end }
      rivet.rule{ name = "file", outs = { "gen/x.txt" }, impl = function(ctx) end }
    "#,
  );
  repo
    .rivet()
    .arg(":dir")
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("gen/x.txt"));
  assert!(!repo.root().join("ran").exists());
}

#[cfg(unix)]
#[test]
fn undeclared_inputs_fail_the_build() {
  let repo = TestRepo::new(
    "",
    r#"
      rivet.rule{ name = "sneaky", outs = { "out.txt" }, impl = function(ctx)
        ctx:sh("cat secret.txt > out.txt")
      end }
    "#,
  );
  repo.write_file("secret.txt", "s");
  repo
    .rivet()
    .arg(":sneaky")
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("error:"))
    .stderr(predicate::str::contains("does not declare"));
}

#[cfg(unix)]
#[test]
fn flags_reach_build_files() {
  let repo = TestRepo::new(
    "",
    r#"
      local mode = rivet.flags.mode or "debug"
      rivet.rule{ name = "mode", outs = { "mode.txt" }, impl = function(ctx)
        ctx:sh("echo " .. mode .. " > mode.txt")
      end }
    "#,
  );
  repo.rivet().args([":mode", "--flag", "mode=release"]).assert().success();
  assert_eq!(repo.read_file("mode.txt"), "release\n");
}

#[test]
fn malformed_flags_are_rejected() {
  let repo = copy_repo();
  repo
    .rivet()
    .args([":copy", "--flag", "novalue"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("KEY=VALUE"));
}

#[cfg(unix)]
#[test]
fn profile_prints_timings() {
  let repo = copy_repo();
  repo
    .rivet()
    .args([":copy", "--profile", "--threads", "2"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Timings:"))
    .stdout(predicate::str::contains("built"));
}

#[cfg(unix)]
#[test]
fn custom_cache_directory() {
  let repo = copy_repo();
  let cache = tempfile::TempDir::new().unwrap();
  repo
    .rivet()
    .arg(":copy")
    .arg("--cache-directory")
    .arg(cache.path())
    .assert()
    .success();
  assert!(std::fs::read_dir(cache.path()).unwrap().next().is_some());
  assert!(!repo.root().join(".rivet/cache").exists());
}

#[cfg(unix)]
#[test]
fn paths_resolve_from_the_current_directory() {
  let repo = copy_repo();
  repo.write_file(
    "pkg/BUILD.lua",
    r#"rivet.rule{ name = "pkg", outs = { "p.txt" }, impl = function(ctx) ctx:sh("echo p > p.txt") end }"#,
  );
  repo.rivet_in(Path::new("pkg")).arg("p.txt").assert().success();
  assert_eq!(repo.read_file("pkg/p.txt"), "p\n");
}

#[cfg(unix)]
#[test]
fn nondeterministic_rule_is_reported_as_internal() {
  let repo = TestRepo::new(
    "",
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
  repo
    .rivet()
    .args([":stamp", "--threads", "1"])
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("internal error:"))
    .stderr(predicate::str::contains("this is a bug in rivet"));
}
