use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use mio::net::TcpStream;
use net2::unix::UnixTcpBuilderExt;
use net2::{TcpBuilder, TcpStreamExt};
use rustls::{ProtocolVersion, ServerSession, Session};

/// Socket buffer size applied to accepted connections.
pub const SOCKET_BUFFER_BYTES: usize = 8192;

pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug,PartialEq,Copy,Clone)]
pub enum SocketResult {
  Continue,
  Closed,
  WouldBlock,
  Error,
}

#[derive(Debug,PartialEq,Copy,Clone)]
pub enum TransportProtocol {
  Tcp,
  Ssl2,
  Ssl3,
  Tls1_0,
  Tls1_1,
  Tls1_2,
  Tls1_3,
}

/// Non blocking read/write over a frontend connection, plain or TLS.
///
/// `socket_read` drains into the buffer until it is full, the peer
/// closes, or the socket would block; `socket_write` pushes until the
/// buffer is gone or the socket would block. Short writes therefore show
/// up as `WouldBlock` with a partial size.
pub trait SocketHandler: Send {
  fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult);
  fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult);
  fn socket_ref(&self) -> &TcpStream;
  fn protocol(&self) -> TransportProtocol;

  fn raw_fd(&self) -> RawFd {
    self.socket_ref().as_raw_fd()
  }
}

/// One classification for every I/O error the socket flavors see: a
/// blocked socket, a peer that went away, or something worth logging.
fn classify_io_error(e: &io::Error, context: &str) -> SocketResult {
  match e.kind() {
    ErrorKind::WouldBlock => SocketResult::WouldBlock,
    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
      SocketResult::Closed
    },
    _ => {
      debug!("SOCKET\t{} error={:?}", context, e);
      SocketResult::Error
    },
  }
}

impl SocketHandler for TcpStream {
  fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
    let mut size = 0usize;
    while size < buf.len() {
      match self.read(&mut buf[size..]) {
        Ok(0)  => return (size, SocketResult::Closed),
        Ok(sz) => size += sz,
        Err(e) => return (size, classify_io_error(&e, "read")),
      }
    }
    (size, SocketResult::Continue)
  }

  fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
    let mut size = 0usize;
    while size < buf.len() {
      match self.write(&buf[size..]) {
        Ok(0)  => return (size, SocketResult::WouldBlock),
        Ok(sz) => size += sz,
        Err(e) => return (size, classify_io_error(&e, "write")),
      }
    }
    (size, SocketResult::Continue)
  }

  fn socket_ref(&self) -> &TcpStream { self }

  fn protocol(&self) -> TransportProtocol {
    TransportProtocol::Tcp
  }
}

/// A TLS frontend: the rustls session layered over the raw socket it
/// wraps. Keeping the TcpStream here is what gives the rest of the engine
/// access to the underlying descriptor without reaching into rustls.
pub struct FrontRustls {
  pub stream:  TcpStream,
  pub session: ServerSession,
}

impl FrontRustls {
  /// Pull one round of ciphertext from the socket into the session and
  /// decrypt it. `Continue` means more records may be waiting.
  fn pump_ciphertext(&mut self) -> SocketResult {
    let transport = match self.session.read_tls(&mut self.stream) {
      Ok(0)  => SocketResult::Closed,
      Ok(_)  => SocketResult::Continue,
      Err(e) => classify_io_error(&e, "tls read"),
    };
    if transport == SocketResult::Error {
      return transport;
    }
    if let Err(e) = self.session.process_new_packets() {
      debug!("could not process TLS packets: {:?}", e);
      return SocketResult::Error;
    }
    transport
  }

  /// Push buffered TLS records toward the socket. Returns how the
  /// transport left off and whether anything actually moved.
  fn flush_ciphertext(&mut self) -> (bool, SocketResult) {
    let mut moved = false;
    while self.session.wants_write() {
      match self.session.write_tls(&mut self.stream) {
        Ok(0)  => break,
        Ok(_)  => moved = true,
        Err(e) => return (moved, classify_io_error(&e, "tls write")),
      }
    }
    (moved, SocketResult::Continue)
  }
}

impl SocketHandler for FrontRustls {
  fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
    let mut size = 0usize;

    loop {
      let transport = self.pump_ciphertext();
      if transport == SocketResult::Error {
        return (size, transport);
      }

      // drain whatever plaintext the session now holds
      while size < buf.len() {
        match self.session.read(&mut buf[size..]) {
          Ok(0)  => break,
          Ok(sz) => size += sz,
          Err(e) => {
            let result = classify_io_error(&e, "tls plaintext read");
            match result {
              SocketResult::WouldBlock => break,
              other => return (size, other),
            }
          }
        }
      }

      if size == buf.len() {
        return (size, SocketResult::Continue);
      }
      match transport {
        // the socket may still hold more records
        SocketResult::Continue => {},
        other => return (size, other),
      }
    }
  }

  fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
    let mut buffered = 0usize;

    loop {
      let before = buffered;

      // hand plaintext to the session until it stops taking it
      while buffered < buf.len() {
        match self.session.write(&buf[buffered..]) {
          Ok(0)  => break,
          Ok(sz) => buffered += sz,
          Err(e) => {
            let result = classify_io_error(&e, "tls plaintext write");
            match result {
              SocketResult::WouldBlock => break,
              other => return (buffered, other),
            }
          }
        }
      }

      let (moved, transport) = self.flush_ciphertext();
      if transport != SocketResult::Continue {
        return (buffered, transport);
      }

      if buffered == buf.len() {
        return (buffered, SocketResult::Continue);
      }
      if buffered == before && !moved {
        // neither the session buffer nor the socket made progress
        return (buffered, SocketResult::WouldBlock);
      }
    }
  }

  fn socket_ref(&self) -> &TcpStream { &self.stream }

  fn protocol(&self) -> TransportProtocol {
    self.session.get_protocol_version().map(|version| match version {
      ProtocolVersion::SSLv2   => TransportProtocol::Ssl2,
      ProtocolVersion::SSLv3   => TransportProtocol::Ssl3,
      ProtocolVersion::TLSv1_0 => TransportProtocol::Tls1_0,
      ProtocolVersion::TLSv1_1 => TransportProtocol::Tls1_1,
      ProtocolVersion::TLSv1_2 => TransportProtocol::Tls1_2,
      ProtocolVersion::TLSv1_3 => TransportProtocol::Tls1_3,
      _                        => TransportProtocol::Tls1_3,
    }).unwrap_or(TransportProtocol::Tcp)
  }
}

/// Bind a frontend listening socket with the address reuse options a
/// restart-heavy proxy needs. The accept loops run on their own threads,
/// so the listener stays a std socket; accepted connections are made non
/// blocking before they reach the event loop.
pub fn server_bind(addr: &SocketAddr) -> io::Result<std::net::TcpListener> {
  let builder = if addr.is_ipv4() {
    TcpBuilder::new_v4()?
  } else {
    TcpBuilder::new_v6()?
  };
  builder.reuse_address(true)?;
  builder.reuse_port(true)?;
  builder.bind(addr)?.listen(LISTEN_BACKLOG)
}

/// Apply the frontend socket options to a freshly accepted connection.
/// O_NONBLOCK is not set here: TLS frontends first complete the handshake
/// on the blocking socket, and flip to non blocking afterwards.
pub fn apply_socket_options(stream: &std::net::TcpStream) {
  if let Err(e) = stream.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
    debug!("got error while setting socket option SO_RCVBUF: {:?}", e);
  }
  if let Err(e) = stream.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
    debug!("got error while setting socket option SO_SNDBUF: {:?}", e);
  }
  if let Err(e) = stream.set_keepalive(Some(KEEPALIVE_PERIOD)) {
    debug!("got error while setting socket option SO_KEEPALIVE: {:?}", e);
  }
  if let Err(e) = stream.set_linger(Some(Duration::from_secs(0))) {
    debug!("got error while setting socket option SO_LINGER: {:?}", e);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::TcpListener;

  #[test]
  fn bind_sets_reuse() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = server_bind(&addr).unwrap();
    let bound = listener.local_addr().unwrap();
    // binding the same address again must succeed thanks to SO_REUSEPORT
    let second = server_bind(&bound).unwrap();
    drop(second);
  }

  #[test]
  fn socket_options_apply() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    apply_socket_options(&accepted);
    drop(client);
  }

  #[test]
  fn classify_maps_blocking_and_resets() {
    let blocked = io::Error::new(ErrorKind::WouldBlock, "later");
    assert_eq!(classify_io_error(&blocked, "read"), SocketResult::WouldBlock);
    let reset = io::Error::new(ErrorKind::ConnectionReset, "gone");
    assert_eq!(classify_io_error(&reset, "read"), SocketResult::Closed);
    let other = io::Error::new(ErrorKind::InvalidData, "odd");
    assert_eq!(classify_io_error(&other, "read"), SocketResult::Error);
  }
}
