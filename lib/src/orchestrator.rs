//! The orchestrator wires everything together.
//!
//! It owns the shared bounded event channel and consumes it: new
//! connections are matched with a backend and turned into registered
//! proxy sessions, backend status transitions and OCSP failures are
//! forwarded to the event sink. The ordering invariant lives here: a
//! session is added to the table strictly before its descriptors are
//! registered with the poller, so a readiness event can never fire for
//! an unknown owner.

use std::sync::mpsc::{sync_channel, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use mio::net::TcpStream;

use dynlb_command::config::Config;

use crate::balancer::Balancer;
use crate::error::ProxyError;
use crate::event_loop::{BufferHandler, EventLoop, EventLoopConfig};
use crate::frontend::{FrontConn, Frontend};
use crate::poller::{Interest, Poller};
use crate::session::{lock_session, ProxySession, SessionHolder, SharedSession, DEFAULT_BUFFER_SIZE};
use crate::sink::SinkHandle;
use crate::socket::FrontRustls;
use crate::util::CancellationToken;
use crate::{Event, EventReceiver, EventSender, ProxyEvent, SessionFlow};

/// Capacity of the shared event channel; producers block when it fills.
const EVENT_QUEUE_SIZE: usize = 256;

/// Orchestrator tick between cancellation checks.
const RUN_TICK: Duration = Duration::from_millis(250);

pub struct Orchestrator {
  event_loop:  EventLoop,
  poller:      Arc<Poller>,
  sessions:    SessionHolder,
  balancers:   HashMap<String, Arc<Balancer>>,
  frontends:   Vec<Frontend>,
  bound:       Vec<(String, std::net::SocketAddr)>,
  events_tx:   EventSender,
  events_rx:   EventReceiver,
  sink:        Option<SinkHandle>,
  cancel:      CancellationToken,
  aux_handles: Vec<thread::JoinHandle<()>>,
  loop_handle: Option<thread::JoinHandle<()>>,
  scratch:     Vec<u8>,
}

impl Orchestrator {
  pub fn new(config: &Config) -> Result<Orchestrator, ProxyError> {
    let (events_tx, events_rx) = sync_channel(EVENT_QUEUE_SIZE);
    let cancel = CancellationToken::new();

    let event_loop = EventLoop::new(EventLoopConfig::default())?;
    let poller = event_loop.poller();

    let mut balancers = HashMap::new();
    for group in &config.backends {
      let balancer = Arc::new(Balancer::new(group)?);
      balancers.insert(group.name.clone(), balancer);
    }

    let mut frontends = Vec::with_capacity(config.frontends.len());
    for frontend_config in &config.frontends {
      if !balancers.contains_key(&frontend_config.backend_group) {
        return Err(ProxyError::BalancerNotFound(frontend_config.backend_group.clone()));
      }
      frontends.push(Frontend::new(frontend_config, events_tx.clone(), cancel.clone())?);
    }

    let sink = SinkHandle::from_global(&config.global, cancel.clone());

    Ok(Orchestrator {
      event_loop,
      poller,
      sessions:    SessionHolder::new(),
      balancers,
      frontends,
      bound:       Vec::new(),
      events_tx,
      events_rx,
      sink,
      cancel,
      aux_handles: Vec::new(),
      loop_handle: None,
      scratch:     vec![0u8; DEFAULT_BUFFER_SIZE],
    })
  }

  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn session_holder(&self) -> SessionHolder {
    self.sessions.clone()
  }

  /// Sender half of the shared event channel, for embedding scenarios.
  pub fn event_sender(&self) -> EventSender {
    self.events_tx.clone()
  }

  /// Bound address of a named frontend, available after `start`.
  pub fn frontend_addr(&self, name: &str) -> Option<std::net::SocketAddr> {
    self.bound.iter()
      .find(|(frontend, _)| frontend == name)
      .map(|(_, addr)| *addr)
  }

  /// Start the event loop, the balancers with their probes, the
  /// housekeeper and the frontend accept loops.
  pub fn start(&mut self) -> Result<(), ProxyError> {
    let handle = self.event_loop.start(
      Box::new(BufferHandler::new(DEFAULT_BUFFER_SIZE)), self.sessions.clone());
    self.loop_handle = Some(handle);

    for balancer in self.balancers.values() {
      let handles = balancer.start(&self.cancel, self.events_tx.clone());
      self.aux_handles.extend(handles);
    }

    self.aux_handles.push(self.sessions.start_housekeeper(self.cancel.clone()));

    for frontend in self.frontends.drain(..) {
      let name = frontend.name.clone();
      let (bound, handle) = frontend.listen()?;
      self.bound.push((name, bound));
      self.aux_handles.push(handle);
    }

    Ok(())
  }

  /// Consume events until cancellation, then shut everything down.
  pub fn run(&mut self) {
    loop {
      if self.cancel.is_cancelled() {
        break;
      }
      match self.events_rx.recv_timeout(RUN_TICK) {
        Ok(event)                           => self.handle_event(event),
        Err(RecvTimeoutError::Timeout)      => {},
        Err(RecvTimeoutError::Disconnected) => break,
      }
    }
    self.shutdown();
  }

  fn handle_event(&mut self, event: Event) {
    match event.kind {
      ProxyEvent::NewConnection { conn, group } => self.provision(conn, group),
      other => {
        match &other {
          ProxyEvent::BackendStatus { name, status } => {
            info!("backend {} is now {}", name, status);
          },
          ProxyEvent::OcspValidationError { serial, error, .. } => {
            warn!("OCSP validation failed for certificate {}: {}", serial, error);
          },
          ProxyEvent::UnavailableOcspResponder { serial, error, .. } => {
            warn!("OCSP responder unreachable for certificate {}: {}", serial, error);
          },
          ProxyEvent::Monitor { tags, .. } => {
            debug!("monitor event: {:?}", tags);
          },
          ProxyEvent::NewConnection { .. } => {},
        }
        if let Some(sink) = &self.sink {
          sink.forward(&Event { at_ms: event.at_ms, kind: other });
        }
      }
    }
  }

  /// Turn an accepted frontend connection into a registered session.
  fn provision(&mut self, conn: FrontConn, group: String) {
    let balancer = match self.balancers.get(&group) {
      Some(balancer) => balancer,
      None => {
        warn!("{}", ProxyError::BalancerNotFound(group));
        conn.shutdown();
        return;
      }
    };

    let client_ip = conn.peer_addr().ok().map(|addr| addr.ip());
    let (backend_conn, backend) = match balancer.dial(client_ip) {
      Ok(dialed) => dialed,
      Err(e) => {
        warn!("can't create any new connections to the backends: {}", e);
        conn.shutdown();
        return;
      }
    };

    let backend_stream = match TcpStream::from_stream(backend_conn) {
      Ok(stream) => stream,
      Err(e) => {
        error!("could not adopt backend socket: {:?}", e);
        backend.dec_connections();
        conn.shutdown();
        return;
      }
    };

    let session: SharedSession = match conn {
      FrontConn::Tcp(front) => {
        Arc::new(Mutex::new(ProxySession::new(front, backend_stream, Some(backend))))
      },
      FrontConn::Tls(front) => {
        Arc::new(Mutex::new(ProxySession::<FrontRustls>::new(front, backend_stream, Some(backend))))
      },
    };

    let fds = lock_session(&session).fds();
    debug!("new session {} on fds {:?}", lock_session(&session).id(), fds);

    // table first, registration second: the loop must always find an
    // owner for a registered descriptor
    self.sessions.add(session.clone());

    let mut registered = Vec::new();
    for fd in &fds {
      match self.poller.register(*fd, Interest::ReadErrors) {
        Ok(()) => registered.push(*fd),
        Err(e) => {
          error!("got error while attach read netpoll: {:?}", e);
          self.teardown(&session, &registered);
          return;
        }
      }
    }

    let init_result = lock_session(&session).init(&mut self.scratch);
    match init_result {
      Ok(flows) => {
        for flow in flows {
          match flow {
            SessionFlow::Continue => {},
            SessionFlow::ArmWrite(fd) => {
              if let Err(e) = self.poller.modify(fd, Interest::ReadWriteErrors) {
                error!("[{}] could not arm write interest: {}", fd, e);
              }
            },
            SessionFlow::DisarmWrite(fd) | SessionFlow::RearmRead(fd) => {
              if let Err(e) = self.poller.modify(fd, Interest::ReadErrors) {
                error!("[{}] could not rearm read interest: {}", fd, e);
              }
            },
          }
        }
      },
      Err(e) => {
        if e.is_closed_stream() {
          debug!("session ended during init");
        } else {
          warn!("session init failed: {}", e);
        }
        self.teardown(&session, &fds);
      }
    }
  }

  fn teardown(&self, session: &SharedSession, registered_fds: &[i32]) {
    for fd in registered_fds {
      if let Err(e) = self.poller.unregister(*fd) {
        debug!("[{}] error occurs while detaching fd from netpoll: {:?}", fd, e);
      }
    }
    if let Err(e) = lock_session(session).close() {
      error!("got error while closing session: {}", e);
    }
    self.sessions.remove(session);
  }

  fn shutdown(&mut self) {
    info!("shutting down");
    self.cancel.cancel();

    // drop connections still queued behind the cancellation
    loop {
      match self.events_rx.try_recv() {
        Ok(event) => {
          if let ProxyEvent::NewConnection { conn, .. } = event.kind {
            conn.shutdown();
          }
        },
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
      }
    }

    for session in self.sessions.drain() {
      let mut guard = lock_session(&session);
      for fd in guard.fds() {
        if let Err(e) = self.poller.unregister(fd) {
          debug!("[{}] error occurs while detaching fd from netpoll: {:?}", fd, e);
        }
      }
      if let Err(e) = guard.close() {
        error!("got error while closing session: {}", e);
      }
    }

    if let Some(sink) = self.sink.take() {
      sink.stop();
    }

    self.event_loop.stop();
    if let Some(handle) = self.loop_handle.take() {
      if handle.join().is_err() {
        error!("event loop thread panicked");
      }
    }
    for handle in self.aux_handles.drain(..) {
      if handle.join().is_err() {
        error!("auxiliary thread panicked");
      }
    }
  }
}

impl Drop for Orchestrator {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
