//! rivet-lib: the incremental build engine behind `rivet`
//!
//! Build files (`BUILD.lua`, `WORKSPACE.lua`) declare rules into a
//! [`graph::TargetGraph`]. Building a target runs each rule's Lua
//! implementation inside an [`context::ExecutionContext`] that records
//! every dependency, command and input into a fingerprint. The fingerprint
//! addresses the rule's outputs in the [`cache::Cache`], and rules whose
//! inputs are only known after running are verified in a sandbox.
//!
//! - `graph`: rules, outputs and the lookup from paths to producers
//! - `lua`: the build file language and the rule implementation API
//! - `context`: preview, execution and setup contexts
//! - `cache`: content-addressed output and memo storage
//! - `execute`: the worker pool and the setup bootstrap

pub mod cache;
pub mod consts;
pub mod context;
pub mod depset;
pub mod execute;
pub mod graph;
pub mod lua;
pub mod sandbox;
pub mod shell;
pub mod util;
pub mod value;
pub mod workspace;
