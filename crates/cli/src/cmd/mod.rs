mod build;
mod locate;

pub use build::{BuildArgs, cmd_build};
pub use locate::cmd_locate;
