use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use mio::net::TcpStream;

use crate::backend::Backend;
use crate::error::ProxyError;
use crate::session::{generate_id, Session, SessionStats, READ_BUDGET};
use crate::socket::{SocketHandler, SocketResult};
use crate::util::now_ms;
use crate::SessionFlow;

/// Full duplex byte shuttle between one frontend connection and one
/// backend connection.
///
/// The session is the sole owner and sole closer of both sockets. Reads
/// are edge triggered: a single `on_read` drains the source with a
/// bounded budget and forwards each chunk; a short write toward the other
/// side queues the tail and asks the loop for write interest.
pub struct ProxySession<Front: SocketHandler> {
  id:             String,
  front_fd:       RawFd,
  back_fd:        RawFd,
  frontend:       Front,
  backend:        TcpStream,
  to_back:        Vec<u8>,
  to_front:       Vec<u8>,
  stats:          SessionStats,
  backend_handle: Option<Arc<Backend>>,
  closed:         bool,
}

impl<Front: SocketHandler> ProxySession<Front> {
  pub fn new(frontend: Front, backend: TcpStream, backend_handle: Option<Arc<Backend>>)
    -> ProxySession<Front> {
    let front_peer = frontend.socket_ref().peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_else(|_| String::from("-"));
    let back_peer = backend.peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_else(|_| String::from("-"));

    let front_fd = frontend.raw_fd();
    let back_fd  = backend.as_raw_fd();

    trace!("[{}↔{}] created proxy session", front_fd, back_fd);

    ProxySession {
      id:             generate_id(&front_peer, &back_peer),
      front_fd,
      back_fd,
      frontend,
      backend,
      to_back:        Vec::new(),
      to_front:       Vec::new(),
      stats:          SessionStats { last_activity_ms: now_ms(), ..Default::default() },
      backend_handle,
      closed:         false,
    }
  }

  pub fn front_fd(&self) -> RawFd {
    self.front_fd
  }

  pub fn back_fd(&self) -> RawFd {
    self.back_fd
  }

  fn map_write_failure(&self, result: SocketResult, target: &str) -> ProxyError {
    match result {
      SocketResult::Closed => ProxyError::ClosedStream,
      _ => ProxyError::Io(io::Error::new(io::ErrorKind::Other,
        format!("{} write error on session {}", target, self.id))),
    }
  }

  /// Flush the queued tail toward the backend. `Continue` means the
  /// transport is still blocked and write interest must stay armed.
  fn flush_to_back(&mut self) -> Result<SessionFlow, ProxyError> {
    let (sz, result) = self.backend.socket_write(&self.to_back);
    self.to_back.drain(..sz);
    if sz > 0 {
      self.stats.last_activity_ms = now_ms();
    }
    match result {
      SocketResult::Continue   => Ok(SessionFlow::DisarmWrite(self.back_fd)),
      SocketResult::WouldBlock => Ok(SessionFlow::Continue),
      failure => Err(self.map_write_failure(failure, "backend")),
    }
  }

  /// Same toward the frontend. An empty tail still goes through the
  /// write path: a TLS frontend can hold ciphertext the socket refused
  /// earlier, and this is where it gets pushed out.
  fn flush_to_front(&mut self) -> Result<SessionFlow, ProxyError> {
    let (sz, result) = self.frontend.socket_write(&self.to_front);
    self.to_front.drain(..sz);
    if sz > 0 {
      self.stats.last_activity_ms = now_ms();
    }
    match result {
      SocketResult::Continue   => Ok(SessionFlow::DisarmWrite(self.front_fd)),
      SocketResult::WouldBlock => Ok(SessionFlow::Continue),
      failure => Err(self.map_write_failure(failure, "frontend")),
    }
  }

  /// Drain the frontend and forward to the backend.
  fn read_front(&mut self, buffer: &mut [u8]) -> Result<SessionFlow, ProxyError> {
    // a queued tail must drain before anything new is read, otherwise
    // bytes would reach the backend out of order
    if !self.to_back.is_empty() {
      self.flush_to_back()?;
      if !self.to_back.is_empty() {
        return Ok(SessionFlow::ArmWrite(self.back_fd));
      }
    }

    for _ in 0..READ_BUDGET {
      let (n, result) = self.frontend.socket_read(buffer);
      if n > 0 {
        self.stats.received_bytes += n as u64;
        self.stats.last_activity_ms = now_ms();
        debug!("[{}] read {} bytes from frontend of session {}", self.front_fd, n, self.id);

        let (written, write_result) = self.backend.socket_write(&buffer[..n]);
        if written < n {
          match write_result {
            SocketResult::WouldBlock => {
              self.to_back.extend_from_slice(&buffer[written..n]);
              return Ok(SessionFlow::ArmWrite(self.back_fd));
            },
            failure => return Err(self.map_write_failure(failure, "backend")),
          }
        }
      }

      match result {
        SocketResult::Closed     => return Err(ProxyError::ClosedStream),
        SocketResult::Error      => return Err(ProxyError::Io(io::Error::new(
          io::ErrorKind::Other, format!("frontend read error on session {}", self.id)))),
        SocketResult::WouldBlock => return Ok(SessionFlow::Continue),
        SocketResult::Continue   => {},
      }
    }

    // budget exhausted with data left in the kernel buffer; keep write
    // interest if a tail toward this side is still pending
    if self.to_front.is_empty() {
      Ok(SessionFlow::RearmRead(self.front_fd))
    } else {
      Ok(SessionFlow::ArmWrite(self.front_fd))
    }
  }

  /// Drain the backend and forward to the frontend.
  fn read_back(&mut self, buffer: &mut [u8]) -> Result<SessionFlow, ProxyError> {
    if !self.to_front.is_empty() {
      self.flush_to_front()?;
      if !self.to_front.is_empty() {
        return Ok(SessionFlow::ArmWrite(self.front_fd));
      }
    }

    for _ in 0..READ_BUDGET {
      let (n, result) = self.backend.socket_read(buffer);
      if n > 0 {
        self.stats.sent_bytes += n as u64;
        self.stats.last_activity_ms = now_ms();
        debug!("[{}] read {} bytes from backend of session {}", self.back_fd, n, self.id);

        let (written, write_result) = self.frontend.socket_write(&buffer[..n]);
        if written < n {
          match write_result {
            SocketResult::WouldBlock => {
              self.to_front.extend_from_slice(&buffer[written..n]);
              return Ok(SessionFlow::ArmWrite(self.front_fd));
            },
            failure => return Err(self.map_write_failure(failure, "frontend")),
          }
        } else if write_result == SocketResult::WouldBlock {
          // every byte was accepted but the TLS layer could not push
          // all of it onto the socket yet
          return Ok(SessionFlow::ArmWrite(self.front_fd));
        }
      }

      match result {
        SocketResult::Closed     => return Err(ProxyError::ClosedStream),
        SocketResult::Error      => return Err(ProxyError::Io(io::Error::new(
          io::ErrorKind::Other, format!("backend read error on session {}", self.id)))),
        SocketResult::WouldBlock => return Ok(SessionFlow::Continue),
        SocketResult::Continue   => {},
      }
    }

    if self.to_back.is_empty() {
      Ok(SessionFlow::RearmRead(self.back_fd))
    } else {
      Ok(SessionFlow::ArmWrite(self.back_fd))
    }
  }
}

impl<Front: SocketHandler> Session for ProxySession<Front> {
  fn init(&mut self, buffer: &mut [u8]) -> Result<Vec<SessionFlow>, ProxyError> {
    let mut flows = Vec::new();
    flows.push(self.on_read(self.front_fd, buffer)?);
    flows.push(self.on_read(self.back_fd, buffer)?);
    Ok(flows)
  }

  fn on_read(&mut self, fd: RawFd, buffer: &mut [u8]) -> Result<SessionFlow, ProxyError> {
    if fd == self.front_fd {
      self.read_front(buffer)
    } else if fd == self.back_fd {
      self.read_back(buffer)
    } else {
      debug!("[{}] read event for a descriptor this session does not own", fd);
      Ok(SessionFlow::Continue)
    }
  }

  fn on_write(&mut self, fd: RawFd) -> Result<SessionFlow, ProxyError> {
    if fd == self.back_fd {
      self.flush_to_back()
    } else if fd == self.front_fd {
      self.flush_to_front()
    } else {
      debug!("[{}] write event for a descriptor this session does not own", fd);
      Ok(SessionFlow::Continue)
    }
  }

  fn fds(&self) -> Vec<RawFd> {
    vec![self.front_fd, self.back_fd]
  }

  fn close(&mut self) -> Result<(), ProxyError> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;

    if let Some(backend) = self.backend_handle.take() {
      backend.dec_connections();
    }

    if let Err(e) = self.frontend.socket_ref().shutdown(Shutdown::Both) {
      if e.kind() != io::ErrorKind::NotConnected {
        debug!("error closing front socket of session {}: {:?}", self.id, e);
      }
    }
    if let Err(e) = self.backend.shutdown(Shutdown::Both) {
      if e.kind() != io::ErrorKind::NotConnected {
        debug!("error closing back socket of session {}: {:?}", self.id, e);
      }
    }
    Ok(())
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn stats(&self) -> SessionStats {
    self.stats
  }
}

impl<Front: SocketHandler> Drop for ProxySession<Front> {
  fn drop(&mut self) {
    let _ = self.close();
  }
}
