//! End-to-end tests of the build engine against throwaway repositories.

mod common;

mod build_tests;
mod discovery_tests;
