//! Embedded Lua: the build file language and the rule implementation API.
//!
//! Interpreters are not `Send`; each thread that runs rules owns a
//! [`Loader`] of its own, and values cross threads as [`crate::value::Value`].

pub mod convert;
mod ctx;
mod loader;
mod primitives;
mod runtime;

pub use loader::{Flags, LoadError, Loaded, Loader};
pub use runtime::{RuleRun, run_rule};
