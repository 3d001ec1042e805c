mod cmd;
mod output;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rivet_lib::execute::{BuildError, CacheLocation};

use crate::output::print_error;

/// rivet - incremental, sandbox-verified builds from Lua build files
#[derive(Parser)]
#[command(name = "rivet")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Target to build: `:name` or an output path relative to the current
  /// directory (default: the workspace's default build rule)
  target: Option<String>,

  /// Print per-rule timings after building
  #[arg(long)]
  profile: bool,

  /// Print the rule producing TARGET instead of building it
  #[arg(long)]
  locate: bool,

  /// Number of worker threads (default: available parallelism)
  #[arg(short = 'j', long, value_name = "N")]
  threads: Option<usize>,

  /// Cache directory, or an http(s):// URL of a remote cache
  #[arg(long, value_name = "DIR")]
  cache_directory: Option<String>,

  /// Build flag visible to build files as `rivet.flags` (repeatable)
  #[arg(long = "flag", value_name = "KEY=VALUE", value_parser = parse_flag)]
  flags: Vec<(String, String)>,

  /// Enable debug logging
  #[arg(short, long)]
  verbose: bool,
}

fn parse_flag(arg: &str) -> Result<(String, String), String> {
  match arg.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected KEY=VALUE, got '{arg}'")),
  }
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let flags = cli.flags.into_iter().collect();
  let result = if cli.locate {
    cmd::cmd_locate(cli.target.as_deref(), &flags)
  } else {
    let options = cmd::BuildArgs {
      threads: cli.threads,
      cache: cli.cache_directory.as_deref().map(CacheLocation::parse),
      flags,
      profile: cli.profile,
    };
    cmd::cmd_build(cli.target.as_deref(), options)
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      match err.downcast_ref::<BuildError>() {
        Some(build) if build.is_internal() => {
          print_error(&format!("internal error: {err}"));
          eprintln!("this is a bug in rivet, not in your build files");
        }
        _ => print_error(&format!("error: {err}")),
      }
      ExitCode::FAILURE
    }
  }
}
