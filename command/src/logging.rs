//! Logging bootstrap.
//!
//! The proxy logs through the `log` macros everywhere; this module wires
//! them to env_logger with the level and timestamp format taken from the
//! `global` section of the configuration. A `RUST_LOG` environment
//! variable still takes precedence over the configured level.

use std::env;

use crate::config::LogLevel;

pub fn setup(level: LogLevel, timestamp: bool) {
  let mut builder = env_logger::Builder::new();
  builder.filter_level(level.to_filter());
  if timestamp {
    builder.format_timestamp_millis();
  } else {
    builder.format_timestamp(None);
  }
  if let Ok(spec) = env::var("RUST_LOG") {
    builder.parse_filters(&spec);
  }
  // ignore double initialization, tests set the logger up repeatedly
  let _ = builder.try_init();
}
