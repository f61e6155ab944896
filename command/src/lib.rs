//! Shared configuration and operational types for the dynlb proxy.
//!
//! This crate holds everything the proxy library and the binary have in
//! common: the configuration model (loaded from TOML or YAML depending on
//! the file extension), the logging bootstrap, and the serializable
//! operational event published by the event sink.

#[macro_use] extern crate serde_derive;
extern crate chrono;
extern crate env_logger;
extern crate log;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;
extern crate toml;

pub mod config;
pub mod event;
pub mod logging;
