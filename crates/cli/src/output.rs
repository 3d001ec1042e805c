//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages and human-readable durations.

use std::time::Duration;

use owo_colors::{OwoColorize, Stream};
use rivet_lib::execute::RuleTiming;

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
}

/// Durations rounded to milliseconds, e.g. `1s 250ms`.
pub fn format_duration(duration: Duration) -> String {
  let rounded = Duration::from_millis(duration.as_millis() as u64);
  if rounded.is_zero() {
    return "0ms".to_string();
  }
  humantime::format_duration(rounded).to_string()
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// Per-rule timings, one aligned row each, in the order given.
pub fn print_timings(timings: &[RuleTiming]) {
  println!();
  println!("Timings:");
  for timing in timings {
    let elapsed = format_duration(timing.elapsed);
    println!(
      "  {:>10}  {:<18} {}",
      elapsed.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      timing.outcome.to_string(),
      timing.rule
    );
  }
}
