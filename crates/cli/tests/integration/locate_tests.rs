//! `--locate` integration tests.

use predicates::prelude::*;

use super::common::{COPY_BUILD, TestRepo};

#[test]
fn prints_the_producing_rule() {
  let repo = TestRepo::new("", COPY_BUILD);
  repo.write_file("a.txt", "a");
  repo
    .rivet()
    .args(["--locate", "b.txt"])
    .assert()
    .success()
    .stdout(predicate::str::contains(":copy"))
    .stdout(predicate::str::contains("BUILD.lua"))
    .stdout(predicate::str::contains("b.txt"));
  assert!(!repo.root().join("b.txt").exists());
}

#[test]
fn unknown_targets_fail() {
  let repo = TestRepo::new("", COPY_BUILD);
  repo
    .rivet()
    .args(["--locate", "nothing.txt"])
    .assert()
    .failure()
    .code(1);
}
