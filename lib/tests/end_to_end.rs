//! End to end proxying over real sockets: a configured frontend, a
//! balancer with one backend, the orchestrator and the event loop.

extern crate dynlb_command_lib as dynlb_command;
extern crate dynlb_lib as dynlb;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use dynlb::orchestrator::Orchestrator;
use dynlb::session::SessionHolder;
use dynlb_command::config::{BackendConfig, BackendGroupConfig, Config, FrontendConfig,
  GlobalConfig, Network};

fn test_config(frontend_addr: &str, backend_addr: &str) -> Config {
  Config {
    global: GlobalConfig::default(),
    frontends: vec![FrontendConfig {
      name:                      String::from("fe1"),
      net:                       Network::Tcp,
      address:                   frontend_addr.to_string(),
      backend_group:             String::from("g1"),
      tls_skip_verify:           false,
      tls_ca_cert_path:          None,
      tls_cert_path:             None,
      tls_pk_path:               None,
      ocsp_staple_enabled:       false,
      ocsp_validation_enabled:   false,
      ocsp_cache_enabled:        false,
      ocsp_auto_renewal_enabled: false,
      ocsp_responder_url:        None,
    }],
    backends: vec![BackendGroupConfig {
      name:     String::from("g1"),
      strategy: None,
      servers:  vec![BackendConfig {
        name:                    String::from("b1"),
        net:                     Network::Tcp,
        address:                 backend_addr.to_string(),
        health_check_period_sec: None,
      }],
    }],
  }
}

/// Echo server closing each connection after `limit` bytes when a limit
/// is given.
fn spawn_echo_server(limit: Option<usize>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  thread::spawn(move || {
    for conn in listener.incoming() {
      let mut conn = match conn {
        Ok(conn) => conn,
        Err(_)   => continue,
      };
      let limit = limit;
      thread::spawn(move || {
        let mut seen = 0usize;
        let mut buffer = [0u8; 4096];
        loop {
          let n = match conn.read(&mut buffer) {
            Ok(0) | Err(_) => return,
            Ok(n)          => n,
          };
          if conn.write_all(&buffer[..n]).is_err() {
            return;
          }
          seen += n;
          if let Some(limit) = limit {
            if seen >= limit {
              return; // simulate a backend dying mid-session
            }
          }
        }
      });
    }
  });
  addr
}

struct RunningProxy {
  sessions: SessionHolder,
  cancel:   dynlb::util::CancellationToken,
  frontend: SocketAddr,
  runner:   Option<thread::JoinHandle<()>>,
}

impl RunningProxy {
  fn start(config: Config) -> RunningProxy {
    let mut orchestrator = Orchestrator::new(&config).unwrap();
    orchestrator.start().unwrap();
    let sessions = orchestrator.session_holder();
    let cancel = orchestrator.cancel_token();
    let frontend = orchestrator.frontend_addr("fe1").unwrap();
    let runner = thread::spawn(move || orchestrator.run());
    RunningProxy { sessions, cancel, frontend, runner: Some(runner) }
  }

  fn wait_for_session_count(&self, expected: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
      if self.sessions.count() == expected {
        return true;
      }
      thread::sleep(Duration::from_millis(10));
    }
    self.sessions.count() == expected
  }
}

impl Drop for RunningProxy {
  fn drop(&mut self) {
    self.cancel.cancel();
    if let Some(runner) = self.runner.take() {
      let _ = runner.join();
    }
  }
}

#[test]
fn plain_tcp_echo_through_the_proxy() {
  let backend = spawn_echo_server(None);
  let proxy = RunningProxy::start(test_config("127.0.0.1:0", &backend.to_string()));

  let mut client = TcpStream::connect(proxy.frontend).unwrap();
  client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
  client.write_all(b"Hello, lb!\n").unwrap();

  let mut reply = [0u8; 11];
  client.read_exact(&mut reply).unwrap();
  assert_eq!(&reply[..], b"Hello, lb!\n");

  assert!(proxy.wait_for_session_count(1, Duration::from_secs(2)));

  // both directions moved the same eleven bytes
  let deadline = Instant::now() + Duration::from_secs(2);
  loop {
    let sessions = proxy.sessions.snapshot();
    assert_eq!(sessions.len(), 1);
    let stats = sessions[0].lock().unwrap().stats();
    if stats.received_bytes == 11 && stats.sent_bytes == 11 {
      break;
    }
    assert!(Instant::now() < deadline,
      "stats did not settle: sent={} received={}", stats.sent_bytes, stats.received_bytes);
    thread::sleep(Duration::from_millis(10));
  }
}

#[test]
fn backend_down_at_start_drops_the_client() {
  // reserve an address nothing listens on
  let unused = TcpListener::bind("127.0.0.1:0").unwrap();
  let backend = unused.local_addr().unwrap();
  drop(unused);

  let proxy = RunningProxy::start(test_config("127.0.0.1:0", &backend.to_string()));

  let mut client = TcpStream::connect(proxy.frontend).unwrap();
  client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

  // the connection is accepted, then closed with zero bytes; the reset
  // variant is possible because the frontend sets SO_LINGER{0,0}
  let mut buffer = [0u8; 16];
  match client.read(&mut buffer) {
    Ok(n)  => assert_eq!(n, 0),
    Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
  }

  assert!(proxy.wait_for_session_count(0, Duration::from_secs(2)));
}

#[test]
fn backend_failure_mid_session_closes_the_client() {
  let backend = spawn_echo_server(Some(5));
  let proxy = RunningProxy::start(test_config("127.0.0.1:0", &backend.to_string()));

  let mut client = TcpStream::connect(proxy.frontend).unwrap();
  client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
  client.write_all(b"12345").unwrap();

  // the echo of the five bytes may or may not arrive before the close;
  // what must happen is an EOF and a clean teardown
  let mut total = 0usize;
  let mut buffer = [0u8; 16];
  loop {
    match client.read(&mut buffer) {
      Ok(0)  => break,
      Ok(n)  => total += n,
      Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
      Err(e) => panic!("unexpected read error: {:?}", e),
    }
  }
  assert!(total <= 5);

  assert!(proxy.wait_for_session_count(0, Duration::from_secs(2)));

  // the frontend keeps accepting and the backend still listens, so the
  // next connection is proxied again
  let mut second = TcpStream::connect(proxy.frontend).unwrap();
  second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
  second.write_all(b"abc").unwrap();
  let mut reply = [0u8; 3];
  second.read_exact(&mut reply).unwrap();
  assert_eq!(&reply, b"abc");
}
