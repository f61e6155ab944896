//! This library provides the engine of a dynamic L4 reverse proxy.
//!
//! It handles network polling, byte shuttling between frontends and
//! backends, and TLS with mutual authentication in a fast single threaded
//! event loop. Frontends accept plain TCP or TLS connections, a named
//! backend group supplies a backend through a load balancing policy, and
//! a session shuttles bytes in both directions until either side closes.
//!
//! The event loop runs in its own thread and owns all socket readiness
//! dispatch; per connection state lives in a session table keyed by raw
//! descriptor. Auxiliary work (health probes, OCSP refreshes, the event
//! sink, the accept loops) runs on separate threads and communicates
//! over bounded channels only.
//!
//! ```ignore
//! let config = Config::load_from_path("config.toml")?;
//! let mut orchestrator = Orchestrator::new(&config)?;
//! orchestrator.start()?;
//! orchestrator.run();
//! ```

#[macro_use] extern crate log;
extern crate chrono;
extern crate hashbrown;
extern crate hex;
extern crate kafka;
extern crate libc;
extern crate mio;
extern crate net2;
extern crate rustls;
extern crate serde_json;
extern crate sha2;
extern crate thiserror;
extern crate ureq;
extern crate uuid;
extern crate webpki;
extern crate x509_parser;
extern crate dynlb_command_lib as dynlb_command;
#[cfg(test)]
#[macro_use]
extern crate quickcheck;
#[cfg(test)]
extern crate rand;
#[cfg(test)]
extern crate tiny_http;

pub mod util;
pub mod error;
pub mod socket;
pub mod poller;
pub mod session;
pub mod event_loop;
pub mod backend;
pub mod balancer;
pub mod tls;
pub mod ocsp;
pub mod frontend;
pub mod orchestrator;
pub mod sink;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{Receiver, SyncSender};

pub use crate::error::ProxyError;

use crate::backend::BackendState;
use crate::frontend::FrontConn;

/// What a session asks of the event loop after handling readiness.
///
/// Sessions do not touch the poller themselves; a short write queues the
/// unwritten tail and requests write interest on the destination
/// descriptor, and a drained tail requests the interest back off.
/// `RearmRead` re-arms the edge on a source that still holds data after
/// the bounded read budget ran out, since the kernel will not signal
/// that data again on its own.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum SessionFlow {
  Continue,
  ArmWrite(RawFd),
  DisarmWrite(RawFd),
  RearmRead(RawFd),
}

/// Internal proxy event, exchanged over the shared bounded channel.
#[derive(Debug)]
pub enum ProxyEvent {
  NewConnection {
    conn:  FrontConn,
    group: String,
  },
  BackendStatus {
    name:   String,
    status: BackendState,
  },
  OcspValidationError {
    serial: String,
    error:  String,
    msg:    String,
  },
  UnavailableOcspResponder {
    serial: String,
    error:  String,
    msg:    String,
  },
  Monitor {
    tags:     Vec<String>,
    metadata: HashMap<String, String>,
  },
}

/// Envelope stamping every event with a unix millisecond timestamp.
#[derive(Debug)]
pub struct Event {
  pub at_ms: i64,
  pub kind:  ProxyEvent,
}

impl Event {
  pub fn new(kind: ProxyEvent) -> Event {
    Event {
      at_ms: util::now_ms(),
      kind,
    }
  }
}

pub type EventSender   = SyncSender<Event>;
pub type EventReceiver = Receiver<Event>;
