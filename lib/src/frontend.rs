//! Frontend listeners.
//!
//! Each frontend binds its address and runs one accept thread. Accepted
//! sockets get the frontend socket options; TLS frontends complete the
//! handshake on the accept thread (the event loop never blocks), then
//! everything is flipped to non blocking and published to the
//! orchestrator as a `NewConnection` event. Handshake failures close the
//! socket, emit a monitor event and accepting continues.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::net::TcpStream;
use rustls::{ServerConfig, ServerSession, Session};

use dynlb_command::config::{FrontendConfig, Network};

use crate::error::ProxyError;
use crate::ocsp::{OcspConfig, OcspProcessor};
use crate::socket::{apply_socket_options, server_bind, FrontRustls};
use crate::tls::{build_server_config, TlsSettings};
use crate::util::CancellationToken;
use crate::{Event, EventSender, ProxyEvent};

/// How long an accept thread sleeps when the listener has nothing,
/// which is also its cancellation latency.
const ACCEPT_IDLE: Duration = Duration::from_millis(100);

/// Upper bound on a blocking TLS handshake with one client.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An accepted frontend connection on its way to the orchestrator.
pub enum FrontConn {
  Tcp(TcpStream),
  Tls(FrontRustls),
}

impl FrontConn {
  pub fn raw_fd(&self) -> RawFd {
    match self {
      FrontConn::Tcp(stream) => stream.as_raw_fd(),
      FrontConn::Tls(front)  => front.stream.as_raw_fd(),
    }
  }

  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    match self {
      FrontConn::Tcp(stream) => stream.peer_addr(),
      FrontConn::Tls(front)  => front.stream.peer_addr(),
    }
  }

  pub fn shutdown(&self) {
    let stream = match self {
      FrontConn::Tcp(stream) => stream,
      FrontConn::Tls(front)  => &front.stream,
    };
    if let Err(e) = stream.shutdown(Shutdown::Both) {
      if e.kind() != io::ErrorKind::NotConnected {
        debug!("error shutting down rejected frontend connection: {:?}", e);
      }
    }
  }
}

impl std::fmt::Debug for FrontConn {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match self {
      FrontConn::Tcp(_) => write!(f, "FrontConn::Tcp(fd {})", self.raw_fd()),
      FrontConn::Tls(_) => write!(f, "FrontConn::Tls(fd {})", self.raw_fd()),
    }
  }
}

pub struct Frontend {
  pub name:      String,
  pub network:   Network,
  pub address:   SocketAddr,
  default_group: String,
  tls_config:    Option<Arc<ServerConfig>>,
  events:        EventSender,
  cancel:        CancellationToken,
}

impl Frontend {
  pub fn new(config: &FrontendConfig, events: EventSender, cancel: CancellationToken)
    -> Result<Frontend, ProxyError> {
    if config.net == Network::Udp {
      return Err(ProxyError::Configuration(
        format!("frontend {}: udp frontends are not supported", config.name)));
    }
    let address = config.address.parse::<SocketAddr>().map_err(|_| {
      ProxyError::Configuration(format!("frontend {}: invalid address {}", config.name, config.address))
    })?;

    let ocsp = OcspConfig::from_frontend(config)
      .map(|ocsp_config| Arc::new(OcspProcessor::new(ocsp_config, events.clone())));

    let tls_config = if config.has_tls() {
      let settings = TlsSettings {
        skip_verify:  config.tls_skip_verify,
        ca_cert_path: config.tls_ca_cert_path.clone().unwrap_or_default(),
        cert_path:    config.tls_cert_path.clone().unwrap_or_default(),
        key_path:     config.tls_pk_path.clone().unwrap_or_default(),
      };
      Some(build_server_config(&settings, ocsp, config.ocsp_staple_enabled)?)
    } else {
      None
    };

    Ok(Frontend {
      name:          config.name.clone(),
      network:       config.net,
      address,
      default_group: config.backend_group.clone(),
      tls_config,
      events,
      cancel,
    })
  }

  /// Bind and start accepting. Returns the bound address (useful when
  /// the configuration asked for port 0) and the accept thread handle.
  pub fn listen(self) -> Result<(SocketAddr, thread::JoinHandle<()>), ProxyError> {
    let listener = server_bind(&self.address)?;
    listener.set_nonblocking(true)?;
    let bound = listener.local_addr()?;
    info!("frontend {} listening on {}", self.name, bound);

    let handle = thread::Builder::new()
      .name(format!("frontend-{}", self.name))
      .spawn(move || self.accept_loop(listener))
      .expect("could not spawn the frontend accept thread");

    Ok((bound, handle))
  }

  fn accept_loop(self, listener: std::net::TcpListener) {
    loop {
      match listener.accept() {
        Ok((conn, peer)) => {
          trace!("frontend {} accepted connection from {}", self.name, peer);
          self.handle_accept(conn, peer);
        },
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
          if self.cancel.wait(ACCEPT_IDLE) {
            debug!("stopping accept loop of frontend {}", self.name);
            return;
          }
        },
        Err(e) => {
          error!("got error while accept connection: {:?}", e);
          if self.cancel.wait(ACCEPT_IDLE) {
            return;
          }
        }
      }
    }
  }

  fn handle_accept(&self, conn: std::net::TcpStream, peer: SocketAddr) {
    apply_socket_options(&conn);

    let front = match &self.tls_config {
      None => {
        if let Err(e) = conn.set_nonblocking(true) {
          error!("could not make accepted socket non blocking: {:?}", e);
          return;
        }
        match TcpStream::from_stream(conn) {
          Ok(stream) => FrontConn::Tcp(stream),
          Err(e) => {
            error!("could not adopt accepted socket: {:?}", e);
            return;
          }
        }
      },
      Some(tls_config) => match self.handshake(conn, peer, tls_config.clone()) {
        Some(front) => front,
        None        => return,
      },
    };

    let event = Event::new(ProxyEvent::NewConnection {
      conn:  front,
      group: self.default_group.clone(),
    });
    // the channel is bounded; accept paths block rather than drop
    if self.events.send(event).is_err() {
      debug!("event channel closed, dropping accepted connection");
    }
  }

  /// Complete the TLS handshake on the accept thread, bounded by a read
  /// timeout so one stuck client cannot wedge accepting forever.
  fn handshake(&self, mut conn: std::net::TcpStream, peer: SocketAddr,
    tls_config: Arc<ServerConfig>) -> Option<FrontConn> {
    if let Err(e) = conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT)) {
      debug!("could not bound the handshake: {:?}", e);
    }

    let mut session = ServerSession::new(&tls_config);
    while session.is_handshaking() {
      if let Err(e) = session.complete_io(&mut conn) {
        warn!("TLS handshake error with {}: {:?}", peer, e);
        let _ = conn.shutdown(Shutdown::Both);
        self.emit_handshake_failure(peer, &e);
        return None;
      }
    }

    if conn.set_read_timeout(None).is_err() || conn.set_nonblocking(true).is_err() {
      return None;
    }
    let stream = match TcpStream::from_stream(conn) {
      Ok(stream) => stream,
      Err(e) => {
        error!("could not adopt accepted TLS socket: {:?}", e);
        return None;
      }
    };

    Some(FrontConn::Tls(FrontRustls { stream, session }))
  }

  fn emit_handshake_failure(&self, peer: SocketAddr, error: &io::Error) {
    let mut metadata = HashMap::new();
    metadata.insert(String::from("frontend"), self.name.clone());
    metadata.insert(String::from("peer"), peer.to_string());
    metadata.insert(String::from("error"), error.to_string());
    let event = Event::new(ProxyEvent::Monitor {
      tags: vec![String::from("tls"), String::from("handshake")],
      metadata,
    });
    if self.events.send(event).is_err() {
      debug!("event channel closed, dropping handshake failure event");
    }
  }
}
