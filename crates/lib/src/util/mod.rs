//! Shared utilities.
//!
//! Hashing primitives (running fingerprints, content hashes) and the file
//! copy helpers used when seeding sandboxes and materialising cache entries.

pub mod fs;
pub mod hash;
