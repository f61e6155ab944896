//! Readiness poller over raw descriptors.
//!
//! Thin wrapper around `mio::Poll` registering descriptors through
//! `EventedFd`, with the interest sets the engine uses. Read interest is
//! edge triggered: a readable event is delivered once per edge and the
//! consumer must drain the socket until it would block.
//!
//! Registration and removal take `&self` so the orchestrator can attach
//! descriptors while the event loop thread is waiting; the event buffer
//! is only ever touched by the waiting thread.

use std::cmp;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Token};

pub const MIN_EVENTS_BUFFER_SIZE: usize = 128;

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum Interest {
  Read,
  Write,
  ReadWrite,
  ReadErrors,
  ReadWriteErrors,
  Errors,
}

impl Interest {
  fn to_ready(self) -> Ready {
    let errors = Ready::from(UnixReady::error() | UnixReady::hup());
    match self {
      Interest::Read            => Ready::readable(),
      Interest::Write           => Ready::writable(),
      Interest::ReadWrite       => Ready::readable() | Ready::writable(),
      Interest::ReadErrors      => Ready::readable() | errors,
      Interest::ReadWriteErrors => Ready::readable() | Ready::writable() | errors,
      Interest::Errors          => errors,
    }
  }
}

#[derive(Debug,Clone,Copy)]
pub struct SocketEvent {
  pub fd:        RawFd,
  pub readiness: UnixReady,
}

impl SocketEvent {
  pub fn is_error(&self) -> bool {
    self.readiness.is_error() || self.readiness.is_hup()
  }

  pub fn is_readable(&self) -> bool {
    self.readiness.is_readable()
  }

  pub fn is_writable(&self) -> bool {
    self.readiness.is_writable()
  }
}

pub struct Poller {
  poll:        Poll,
  events:      Mutex<Events>,
  buffer_size: usize,
}

impl Poller {
  /// The buffer size is clamped to at least `MIN_EVENTS_BUFFER_SIZE`.
  pub fn open(events_buffer_size: usize) -> io::Result<Poller> {
    let buffer_size = cmp::max(events_buffer_size, MIN_EVENTS_BUFFER_SIZE);
    Ok(Poller {
      poll:        Poll::new()?,
      events:      Mutex::new(Events::with_capacity(buffer_size)),
      buffer_size,
    })
  }

  pub fn buffer_size(&self) -> usize {
    self.buffer_size
  }

  pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
    trace!("[{}] registering interest {:?}", fd, interest);
    self.poll.register(&EventedFd(&fd), Token(fd as usize), interest.to_ready(), PollOpt::edge())
  }

  pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
    trace!("[{}] modifying interest to {:?}", fd, interest);
    self.poll.reregister(&EventedFd(&fd), Token(fd as usize), interest.to_ready(), PollOpt::edge())
  }

  pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
    trace!("[{}] unregistering", fd);
    self.poll.deregister(&EventedFd(&fd))
  }

  /// Wait for readiness. `None` blocks until at least one event arrives;
  /// interruption by a signal yields an empty batch without error so the
  /// caller can check for shutdown and go back to waiting.
  pub fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<SocketEvent>> {
    let mut events = match self.events.lock() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    match self.poll.poll(&mut events, timeout) {
      Ok(_count) => Ok(
        events.iter()
          .map(|event| SocketEvent {
            fd:        event.token().0 as RawFd,
            readiness: UnixReady::from(event.readiness()),
          })
          .collect()
      ),
      Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(Vec::new()),
      Err(e) => Err(e),
    }
  }

  pub fn close(self) {}
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::net::{TcpListener, TcpStream};
  use std::os::unix::io::AsRawFd;

  fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
  }

  #[test]
  fn clamps_buffer_size() {
    let poller = Poller::open(1).unwrap();
    assert_eq!(poller.buffer_size(), MIN_EVENTS_BUFFER_SIZE);
    let poller = Poller::open(512).unwrap();
    assert_eq!(poller.buffer_size(), 512);
  }

  #[test]
  fn delivers_read_readiness() {
    let poller = Poller::open(128).unwrap();
    let (mut client, server) = loopback_pair();
    server.set_nonblocking(true).unwrap();
    let fd = server.as_raw_fd();
    poller.register(fd, Interest::ReadErrors).unwrap();

    client.write_all(b"ping").unwrap();

    let events = poller.wait(Some(Duration::from_secs(2))).unwrap();
    assert!(events.iter().any(|e| e.fd == fd && e.is_readable()));

    poller.unregister(fd).unwrap();
  }

  #[test]
  fn times_out_empty() {
    let poller = Poller::open(128).unwrap();
    let events = poller.wait(Some(Duration::from_millis(20))).unwrap();
    assert!(events.is_empty());
  }

  #[test]
  fn reports_peer_hup() {
    let poller = Poller::open(128).unwrap();
    let (client, server) = loopback_pair();
    server.set_nonblocking(true).unwrap();
    let fd = server.as_raw_fd();
    poller.register(fd, Interest::Errors).unwrap();

    drop(client);

    let events = poller.wait(Some(Duration::from_secs(2))).unwrap();
    assert!(events.iter().any(|e| e.fd == fd && e.is_error()));
  }
}
