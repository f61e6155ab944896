//! Sessions and their table.
//!
//! A session owns the socket(s) of one logical connection. The proxy
//! flavor holds a frontend and a backend socket and shuttles bytes both
//! ways; the client flavor holds a single socket and hands incoming bytes
//! to a handler (an echo server by default). Both live behind the
//! `Session` trait so the event loop dispatches on raw descriptors
//! without caring which flavor owns them.

pub mod client;
pub mod holder;
pub mod proxy;

pub use self::client::ClientSession;
pub use self::holder::SessionHolder;
pub use self::proxy::ProxySession;

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ProxyError;
use crate::SessionFlow;

/// Scratch buffer size of the event handler, one read chunk.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// How many read/forward rounds a single readiness edge may consume
/// before yielding back to the loop, so one busy session cannot starve
/// the others.
pub const READ_BUDGET: usize = 8;

#[derive(Debug,Clone,Copy,Default,PartialEq,Eq)]
pub struct SessionStats {
  pub last_activity_ms:   i64,
  pub sent_bytes:         u64,
  pub received_bytes:     u64,
}

pub trait Session: Send {
  /// Called once by the orchestrator after the descriptors are
  /// registered, to drain bytes that arrived before registration.
  fn init(&mut self, buffer: &mut [u8]) -> Result<Vec<SessionFlow>, ProxyError>;

  /// Handle read readiness on one of the owned descriptors.
  fn on_read(&mut self, fd: RawFd, buffer: &mut [u8]) -> Result<SessionFlow, ProxyError>;

  /// Handle write readiness: flush the queued tail toward `fd`.
  fn on_write(&mut self, fd: RawFd) -> Result<SessionFlow, ProxyError>;

  fn fds(&self) -> Vec<RawFd>;

  /// Close every owned socket. Idempotent: later calls return Ok.
  fn close(&mut self) -> Result<(), ProxyError>;

  fn id(&self) -> &str;

  fn stats(&self) -> SessionStats;
}

pub type SharedSession = Arc<Mutex<dyn Session>>;

pub(crate) fn lock_session(session: &SharedSession) -> MutexGuard<dyn Session> {
  match session.lock() {
    Ok(guard)     => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

pub(crate) fn generate_id(front: &str, back: &str) -> String {
  format!("{}↔{}", front, back)
}
