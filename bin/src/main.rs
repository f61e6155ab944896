//! dynlb entry point: configuration, logging, resource limits, signal
//! handling and the orchestrator lifecycle.

#[macro_use] extern crate log;
extern crate clap;
extern crate libc;
extern crate nix;
extern crate dynlb_command_lib as dynlb_command;
extern crate dynlb_lib as dynlb;

use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use dynlb::orchestrator::Orchestrator;
use dynlb::util;
use dynlb_command::config::Config;
use dynlb_command::logging;

/// Last signal delivered, consumed by the main wait loop.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_signal(signum: libc::c_int) {
  PENDING_SIGNAL.store(signum, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), nix::Error> {
  let action = SigAction::new(SigHandler::Handler(handle_signal), SaFlags::empty(), SigSet::empty());
  for signal in &[Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGHUP] {
    unsafe {
      sigaction(*signal, &action)?;
    }
  }
  Ok(())
}

fn main() {
  std::process::exit(run());
}

fn run() -> i32 {
  let matches = App::new("dynlb")
    .version(env!("CARGO_PKG_VERSION"))
    .about("dynamic L4 reverse proxy")
    .arg(Arg::with_name("config")
      .short("c")
      .value_name("PATH")
      .help("path to configuration file")
      .takes_value(true)
      .default_value("./cmd/config.toml"))
    .get_matches();

  let config_path = matches.value_of("config").unwrap_or("./cmd/config.toml");
  let config = match Config::load_from_path(config_path) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("{}", e);
      return 1;
    }
  };

  logging::setup(config.global.log_level, config.global.log_timestamp);
  info!("starting proxy...");

  util::raise_nofile_limit(4096, 100_000);

  if let Err(e) = install_signal_handlers() {
    error!("could not install signal handlers: {}", e);
    return 1;
  }

  let mut orchestrator = match Orchestrator::new(&config) {
    Ok(orchestrator) => orchestrator,
    Err(e) => {
      error!("could not initialize the proxy: {}", e);
      return 1;
    }
  };
  if let Err(e) = orchestrator.start() {
    error!("could not start the proxy: {}", e);
    return 1;
  }

  let cancel = orchestrator.cancel_token();
  let runner = thread::Builder::new()
    .name(String::from("orchestrator"))
    .spawn(move || orchestrator.run())
    .expect("could not spawn the orchestrator thread");

  let exit_code = loop {
    thread::sleep(Duration::from_millis(100));
    match PENDING_SIGNAL.swap(0, Ordering::SeqCst) {
      0 => {},
      signum if signum == libc::SIGHUP => {
        info!("SIGHUP received, ignoring");
      },
      signum if signum == libc::SIGINT
        || signum == libc::SIGTERM
        || signum == libc::SIGQUIT => {
        info!("received signal {}, shutting down", signum);
        break 0;
      },
      signum => {
        error!("received unexpected signal {}", signum);
        break 1;
      }
    }
  };

  cancel.cancel();
  if runner.join().is_err() {
    error!("orchestrator thread panicked");
    return 1;
  }
  info!("good bye");
  exit_code
}
