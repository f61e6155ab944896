//! Backends and their health probes.
//!
//! A backend's status is only ever written by its own probe thread; the
//! selection path reads it atomically. Status transitions are pushed onto
//! the owning group's notify channel; the channel is bounded and a full
//! channel drops the update, the next probe tick re-evaluates anyway.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dynlb_command::config::{BackendConfig, Network};

use crate::error::ProxyError;
use crate::util::CancellationToken;

/// Read timeout of the half open probe after a successful connect.
const PROBE_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum BackendState {
  Unknown,
  Enabled,
  Disabled,
}

impl BackendState {
  fn from_u8(value: u8) -> BackendState {
    match value {
      1 => BackendState::Enabled,
      2 => BackendState::Disabled,
      _ => BackendState::Unknown,
    }
  }

  fn as_u8(self) -> u8 {
    match self {
      BackendState::Unknown  => 0,
      BackendState::Enabled  => 1,
      BackendState::Disabled => 2,
    }
  }
}

impl std::fmt::Display for BackendState {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match self {
      BackendState::Unknown  => write!(f, "unknown"),
      BackendState::Enabled  => write!(f, "enabled"),
      BackendState::Disabled => write!(f, "disabled"),
    }
  }
}

/// Status transition published on the group's notify channel.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct StatusChange {
  pub name:   String,
  pub status: BackendState,
}

pub struct Backend {
  pub name:           String,
  pub network:        Network,
  pub address:        SocketAddr,
  status:             AtomicU8,
  active_connections: AtomicUsize,
  healthcheck_period: Option<Duration>,
}

impl Backend {
  pub fn new(config: &BackendConfig) -> Result<Backend, ProxyError> {
    let address = config.address.parse::<SocketAddr>().map_err(|_| {
      ProxyError::Configuration(format!("backend {}: invalid address {}", config.name, config.address))
    })?;
    Ok(Backend {
      name:               config.name.clone(),
      network:            config.net,
      address,
      status:             AtomicU8::new(BackendState::Unknown.as_u8()),
      active_connections: AtomicUsize::new(0),
      healthcheck_period: config.health_check_period_sec.map(Duration::from_secs),
    })
  }

  pub fn status(&self) -> BackendState {
    BackendState::from_u8(self.status.load(Ordering::SeqCst))
  }

  #[cfg(test)]
  pub fn force_status(&self, next: BackendState) {
    self.swap_status(next);
  }

  fn swap_status(&self, next: BackendState) -> BackendState {
    BackendState::from_u8(self.status.swap(next.as_u8(), Ordering::SeqCst))
  }

  pub fn connections(&self) -> usize {
    self.active_connections.load(Ordering::SeqCst)
  }

  pub fn inc_connections(&self) {
    self.active_connections.fetch_add(1, Ordering::SeqCst);
  }

  pub fn dec_connections(&self) {
    // saturating, closing twice must not underflow
    let mut current = self.active_connections.load(Ordering::SeqCst);
    while current > 0 {
      match self.active_connections.compare_exchange(current, current - 1,
        Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_)        => return,
        Err(observed) => current = observed,
      }
    }
  }

  /// Start the backend: without a health check period it goes straight to
  /// enabled, with one the probe thread owns the status from now on.
  pub fn start(self: &Arc<Self>, cancel: &CancellationToken,
    notify: SyncSender<StatusChange>) -> Option<thread::JoinHandle<()>> {
    match self.healthcheck_period {
      None => {
        self.swap_status(BackendState::Enabled);
        None
      },
      Some(period) => {
        let backend = self.clone();
        let cancel  = cancel.clone();
        let handle = thread::Builder::new()
          .name(format!("probe-{}", self.name))
          .spawn(move || backend.run_health_check(cancel, notify, period))
          .expect("could not spawn the health check thread");
        Some(handle)
      }
    }
  }

  fn run_health_check(&self, cancel: CancellationToken, notify: SyncSender<StatusChange>,
    period: Duration) {
    loop {
      if cancel.wait(period) {
        info!("stopped health check for backend: {}", self.name);
        return;
      }
      let next = if self.probe(period) {
        BackendState::Enabled
      } else {
        BackendState::Disabled
      };
      let previous = self.swap_status(next);
      if previous != next {
        info!("backend {} transitioned {} -> {}", self.name, previous, next);
        match notify.try_send(StatusChange { name: self.name.clone(), status: next }) {
          Ok(())                        => {},
          Err(TrySendError::Full(_))    => {
            debug!("notify channel full, dropping status update for {}", self.name)
          },
          Err(TrySendError::Disconnected(_)) => return,
        }
      }
    }
  }

  /// A backend is healthy when it accepts a connection and the socket is
  /// not already half open: an immediate EOF on the one byte read means
  /// the peer accepted and closed right away.
  fn probe(&self, timeout: Duration) -> bool {
    let mut stream = match std::net::TcpStream::connect_timeout(&self.address, timeout) {
      Ok(stream) => stream,
      Err(e) => {
        debug!("probe of backend {} at {} failed: {}", self.name, self.address, e);
        return false;
      }
    };
    if stream.set_read_timeout(Some(PROBE_READ_TIMEOUT)).is_err() {
      return true;
    }
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
      Ok(0) => {
        debug!("probe of backend {} found a half open socket", self.name);
        false
      },
      Ok(_) => true,
      Err(e) => match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => true,
        _ => {
          debug!("probe read on backend {} failed: {}", self.name, e);
          false
        }
      }
    }
  }

  /// Open a new connection. Refused while disabled; the returned socket
  /// is non blocking and counted against `active_connections` until the
  /// owning session closes.
  pub fn dial(&self, timeout: Duration) -> Result<std::net::TcpStream, ProxyError> {
    if self.status() == BackendState::Disabled {
      return Err(ProxyError::NoActiveBackends);
    }
    let conn = std::net::TcpStream::connect_timeout(&self.address, timeout)
      .map_err(|e| {
        debug!("could not connect to backend {} at {}: {}", self.name, self.address, e);
        ProxyError::NoActiveBackends
      })?;
    conn.set_nonblocking(true)?;
    conn.set_nodelay(true).ok();
    self.inc_connections();
    Ok(conn)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::TcpListener;
  use std::sync::mpsc::sync_channel;

  fn backend_config(address: &str, period: Option<u64>) -> BackendConfig {
    BackendConfig {
      name:                    String::from("b1"),
      net:                     Network::Tcp,
      address:                 address.to_string(),
      health_check_period_sec: period,
    }
  }

  #[test]
  fn starts_enabled_without_health_check() {
    let backend = Arc::new(Backend::new(&backend_config("127.0.0.1:1", None)).unwrap());
    assert_eq!(backend.status(), BackendState::Unknown);
    let (tx, _rx) = sync_channel(4);
    let handle = backend.start(&CancellationToken::new(), tx);
    assert!(handle.is_none());
    assert_eq!(backend.status(), BackendState::Enabled);
  }

  #[test]
  fn probe_disables_unreachable_backend() {
    // nothing listens on this port after the listener is dropped
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = Arc::new(Backend::new(&backend_config(&addr.to_string(), Some(1))).unwrap());
    assert!(!backend.probe(Duration::from_millis(200)));
  }

  #[test]
  fn probe_enables_listening_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accepting = thread::spawn(move || {
      // hold the connection open long enough for the probe read to time out
      let (conn, _) = listener.accept().unwrap();
      thread::sleep(Duration::from_millis(300));
      drop(conn);
    });

    let backend = Arc::new(Backend::new(&backend_config(&addr.to_string(), Some(1))).unwrap());
    assert!(backend.probe(Duration::from_millis(500)));
    accepting.join().unwrap();
  }

  #[test]
  fn dial_refuses_disabled_backend() {
    let backend = Backend::new(&backend_config("127.0.0.1:1", None)).unwrap();
    backend.swap_status(BackendState::Disabled);
    assert!(matches!(backend.dial(Duration::from_millis(100)), Err(ProxyError::NoActiveBackends)));
  }

  #[test]
  fn connection_count_never_underflows() {
    let backend = Backend::new(&backend_config("127.0.0.1:1", None)).unwrap();
    backend.inc_connections();
    backend.dec_connections();
    backend.dec_connections();
    assert_eq!(backend.connections(), 0);
  }
}
