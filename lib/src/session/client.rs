use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::TcpStream;

use crate::error::ProxyError;
use crate::session::{generate_id, Session, SessionStats, READ_BUDGET};
use crate::socket::{SocketHandler, SocketResult};
use crate::util::now_ms;
use crate::SessionFlow;

/// Handler invoked for every chunk read from the connection. It receives
/// the connection so it can reply in place.
pub type ClientHandler = Box<dyn FnMut(&mut TcpStream, &[u8]) -> Result<(), ProxyError> + Send>;

/// Single socket session driven by a handler, used for servers that
/// answer their own traffic instead of proxying it.
pub struct ClientSession {
  id:      String,
  fd:      RawFd,
  conn:    TcpStream,
  handler: ClientHandler,
  stats:   SessionStats,
  closed:  bool,
}

impl ClientSession {
  pub fn new(conn: TcpStream, handler: ClientHandler) -> ClientSession {
    let peer = conn.peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_else(|_| String::from("-"));
    let fd = conn.as_raw_fd();
    ClientSession {
      id: generate_id(&peer, &peer),
      fd,
      conn,
      handler,
      stats: SessionStats { last_activity_ms: now_ms(), ..Default::default() },
      closed: false,
    }
  }

  /// A client session that echoes everything back to the peer.
  pub fn echo(conn: TcpStream) -> ClientSession {
    ClientSession::new(conn, Box::new(|conn, data| {
      let (written, result) = conn.socket_write(data);
      if written < data.len() {
        debug!("echo handler dropped {} bytes ({:?})", data.len() - written, result);
      }
      match result {
        SocketResult::Closed => Err(ProxyError::ClosedStream),
        SocketResult::Error  => Err(ProxyError::Io(std::io::Error::new(
          std::io::ErrorKind::Other, "echo write error"))),
        _ => Ok(()),
      }
    }))
  }
}

impl Session for ClientSession {
  fn init(&mut self, buffer: &mut [u8]) -> Result<Vec<SessionFlow>, ProxyError> {
    let flow = self.on_read(self.fd, buffer)?;
    Ok(vec![flow])
  }

  fn on_read(&mut self, _fd: RawFd, buffer: &mut [u8]) -> Result<SessionFlow, ProxyError> {
    for _ in 0..READ_BUDGET {
      let (n, result) = self.conn.socket_read(buffer);
      if n > 0 {
        self.stats.received_bytes += n as u64;
        self.stats.last_activity_ms = now_ms();
        (self.handler)(&mut self.conn, &buffer[..n])?;
      }
      match result {
        SocketResult::Closed     => return Err(ProxyError::ClosedStream),
        SocketResult::Error      => return Err(ProxyError::Io(std::io::Error::new(
          std::io::ErrorKind::Other, format!("read error on session {}", self.id)))),
        SocketResult::WouldBlock => return Ok(SessionFlow::Continue),
        SocketResult::Continue   => {},
      }
    }
    Ok(SessionFlow::RearmRead(self.fd))
  }

  fn on_write(&mut self, _fd: RawFd) -> Result<SessionFlow, ProxyError> {
    // handler driven sessions write inline and keep no tail
    Ok(SessionFlow::DisarmWrite(self.fd))
  }

  fn fds(&self) -> Vec<RawFd> {
    vec![self.fd]
  }

  fn close(&mut self) -> Result<(), ProxyError> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    if let Err(e) = self.conn.shutdown(Shutdown::Both) {
      if e.kind() != std::io::ErrorKind::NotConnected {
        debug!("error closing session {}: {:?}", self.id, e);
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
