//! The event loop.
//!
//! A single thread drains the poller and dispatches readiness to the
//! session owning each descriptor. Errors and hangups are handled first,
//! then reads, then writes. Any handler error other than the
//! `ClosedSession` sentinel makes the loop unregister every descriptor of
//! the session, close it (closing is idempotent) and drop it from the
//! table; `ClosedSession` means the handler already closed it and only
//! the bookkeeping is left.
//!
//! The loop never performs blocking I/O itself: the only suspension point
//! is the poller wait.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::unix::UnixReady;

use crate::error::ProxyError;
use crate::poller::{Interest, Poller, SocketEvent};
use crate::session::{lock_session, Session, SessionHolder, DEFAULT_BUFFER_SIZE};
use crate::SessionFlow;

/// Tick period of the loop; the poller wakes at least this often to
/// observe `stop`.
const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

pub trait EventHandler: Send {
  fn on_read(&mut self, session: &mut dyn Session, fd: RawFd) -> Result<SessionFlow, ProxyError>;
  fn on_write(&mut self, session: &mut dyn Session, fd: RawFd) -> Result<SessionFlow, ProxyError>;
  fn on_error(&mut self, session: &mut dyn Session, errors: Vec<io::Error>) -> Result<SessionFlow, ProxyError>;
}

/// Default handler: owns the scratch buffer and forwards readiness to
/// the session.
pub struct BufferHandler {
  buffer: Vec<u8>,
}

impl BufferHandler {
  pub fn new(buffer_size: usize) -> BufferHandler {
    BufferHandler {
      buffer: vec![0u8; buffer_size.max(1)],
    }
  }
}

impl Default for BufferHandler {
  fn default() -> BufferHandler {
    BufferHandler::new(DEFAULT_BUFFER_SIZE)
  }
}

impl EventHandler for BufferHandler {
  fn on_read(&mut self, session: &mut dyn Session, fd: RawFd) -> Result<SessionFlow, ProxyError> {
    session.on_read(fd, &mut self.buffer)
  }

  fn on_write(&mut self, session: &mut dyn Session, fd: RawFd) -> Result<SessionFlow, ProxyError> {
    session.on_write(fd)
  }

  fn on_error(&mut self, session: &mut dyn Session, errors: Vec<io::Error>) -> Result<SessionFlow, ProxyError> {
    debug!("closing session {} after socket errors: {:?}", session.id(), errors);
    if let Err(e) = session.close() {
      error!("got error while closing session {}: {}", session.id(), e);
    }
    Err(ProxyError::ClosedSession)
  }
}

#[derive(Debug,Clone)]
pub struct EventLoopConfig {
  pub name:              String,
  pub event_buffer_size: usize,
}

impl Default for EventLoopConfig {
  fn default() -> EventLoopConfig {
    EventLoopConfig {
      name:              String::from("main-loop"),
      event_buffer_size: 256,
    }
  }
}

pub struct EventLoop {
  name:    String,
  poller:  Arc<Poller>,
  running: Arc<AtomicBool>,
}

impl EventLoop {
  pub fn new(config: EventLoopConfig) -> io::Result<EventLoop> {
    debug!("init event loop: {:?}", config);
    let poller = Poller::open(config.event_buffer_size)?;
    Ok(EventLoop {
      name:    config.name,
      poller:  Arc::new(poller),
      running: Arc::new(AtomicBool::new(false)),
    })
  }

  /// Registrations go through the shared poller handle; the loop thread
  /// is the only caller of `wait`.
  pub fn poller(&self) -> Arc<Poller> {
    self.poller.clone()
  }

  pub fn start(&self, mut handler: Box<dyn EventHandler>, sessions: SessionHolder)
    -> thread::JoinHandle<()> {
    let poller  = self.poller.clone();
    let running = self.running.clone();
    running.store(true, Ordering::SeqCst);

    thread::Builder::new()
      .name(self.name.clone())
      .spawn(move || {
        info!("starting event loop");
        while running.load(Ordering::SeqCst) {
          let batch = match poller.wait(Some(WAIT_TIMEOUT)) {
            Ok(batch) => batch,
            Err(e) => {
              error!("got error while waiting for the net events: {}", e);
              continue;
            }
          };
          if batch.is_empty() {
            thread::yield_now();
            continue;
          }
          for event in batch {
            dispatch(&poller, handler.as_mut(), &sessions, event);
          }
        }
        info!("ending event loop");
      })
      .expect("could not spawn the event loop thread")
  }

  pub fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
  }
}

fn dispatch(poller: &Poller, handler: &mut dyn EventHandler, sessions: &SessionHolder,
  event: SocketEvent) {
  let fd = event.fd;
  let session = match sessions.find(fd) {
    Some(session) => session,
    None => {
      debug!("[{}] no session for readiness event, unregistering", fd);
      if let Err(e) = poller.unregister(fd) {
        debug!("[{}] error occurs while detaching fd from poller: {}", fd, e);
      }
      return;
    }
  };

  let mut guard = lock_session(&session);
  let result = if event.is_error() {
    handler.on_error(&mut *guard, parse_errors(fd, event.readiness))
  } else if event.is_readable() {
    handler.on_read(&mut *guard, fd)
  } else if event.is_writable() {
    handler.on_write(&mut *guard, fd)
  } else {
    trace!("[{}] spurious event {:?}", fd, event.readiness);
    Ok(SessionFlow::Continue)
  };

  match result {
    Ok(SessionFlow::Continue) => {},
    Ok(SessionFlow::ArmWrite(target)) => {
      if let Err(e) = poller.modify(target, Interest::ReadWriteErrors) {
        error!("[{}] could not arm write interest: {}", target, e);
      }
    },
    Ok(SessionFlow::DisarmWrite(target)) => {
      if let Err(e) = poller.modify(target, Interest::ReadErrors) {
        error!("[{}] could not disarm write interest: {}", target, e);
      }
    },
    Ok(SessionFlow::RearmRead(target)) => {
      // modifying an edge triggered registration redelivers current
      // readiness, so the remaining buffered data fires a fresh event
      if let Err(e) = poller.modify(target, Interest::ReadErrors) {
        error!("[{}] could not rearm read interest: {}", target, e);
      }
    },
    Err(error) => {
      let fds = guard.fds();
      for fd in &fds {
        if let Err(e) = poller.unregister(*fd) {
          debug!("[{}] error occurs while detaching fd from poller: {}", fd, e);
        }
      }
      if !error.is_closed_session() {
        if error.is_closed_stream() {
          debug!("[{}] session {} finished", fd, guard.id());
        } else {
          error!("[{}] error occurs in event loop: {}", fd, error);
        }
        if let Err(e) = guard.close() {
          error!("[{}] error occurs while closing session: {}", fd, e);
        }
      }
      drop(guard);
      sessions.remove_fds(&fds);
    }
  }
}

/// Turn error readiness into the actual socket errors: SO_ERROR first,
/// then a synthetic EOF when the peer hung up.
fn parse_errors(fd: RawFd, readiness: UnixReady) -> Vec<io::Error> {
  let mut errors = Vec::new();
  if readiness.is_error() {
    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
      libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR,
        &mut so_error as *mut _ as *mut libc::c_void, &mut len)
    };
    if ret == 0 && so_error != 0 {
      errors.push(io::Error::from_raw_os_error(so_error));
    }
  }
  if readiness.is_hup() {
    errors.push(io::Error::new(io::ErrorKind::UnexpectedEof, "peer hung up"));
  }
  errors
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::{ClientSession, SharedSession};
  use std::io::{Read, Write};
  use std::net::TcpListener;
  use std::sync::Mutex;

  #[test]
  fn loop_drives_an_echo_session() {
    let event_loop = EventLoop::new(EventLoopConfig::default()).unwrap();
    let sessions = SessionHolder::new();
    let poller = event_loop.poller();
    let handle = event_loop.start(Box::new(BufferHandler::default()), sessions.clone());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut client = std::net::TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    let mio_stream = mio::net::TcpStream::from_stream(accepted).unwrap();

    let session: SharedSession = Arc::new(Mutex::new(ClientSession::echo(mio_stream)));
    let fd = lock_session(&session).fds()[0];
    sessions.add(session);
    poller.register(fd, Interest::ReadErrors).unwrap();

    client.write_all(b"around the loop").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut reply = [0u8; 15];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[..], b"around the loop");

    // closing our end tears the session down
    drop(client);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while sessions.count() > 0 && std::time::Instant::now() < deadline {
      thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sessions.count(), 0);

    event_loop.stop();
    handle.join().unwrap();
  }

  #[test]
  fn unknown_fd_is_unregistered_quietly() {
    let event_loop = EventLoop::new(EventLoopConfig::default()).unwrap();
    let sessions = SessionHolder::new();
    let poller = event_loop.poller();
    let handle = event_loop.start(Box::new(BufferHandler::default()), sessions.clone());

    // register a socket that no session owns
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut client = std::net::TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    use std::os::unix::io::AsRawFd;
    let fd = accepted.as_raw_fd();
    poller.register(fd, Interest::ReadErrors).unwrap();

    client.write_all(b"nobody home").unwrap();
    thread::sleep(Duration::from_millis(200));

    // the descriptor was dropped from the poller; the loop is still alive
    assert_eq!(sessions.count(), 0);
    event_loop.stop();
    handle.join().unwrap();
    drop(accepted);
  }
}
