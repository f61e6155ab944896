//! Backend groups and load balancing.
//!
//! A balancer owns an ordered list of backends, a selection strategy and
//! the group's notify channel. Selection only ever considers backends
//! whose status is not disabled; a backend that has not been probed yet
//! counts as eligible. The supervisor thread consumes status transitions
//! from the probes and republishes them on the shared event channel.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dynlb_command::config::BackendGroupConfig;

use crate::backend::{Backend, StatusChange};
use crate::error::ProxyError;
use crate::util::{now_nanos, CancellationToken};
use crate::{Event, EventSender, ProxyEvent};

/// Magic multiplier of the Lamping-Veach jump consistent hash.
pub const JUMP_HASH_MULTIPLIER: u64 = 2862933555777941757;

/// Capacity of a group's notify channel; probes drop updates on overflow.
const NOTIFY_QUEUE_SIZE: usize = 32;

/// Tick of the supervisor thread between cancellation checks.
const SUPERVISOR_TICK: Duration = Duration::from_millis(250);

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Map a 64 bit key to a bucket in `[0, num_buckets)` with minimal
/// remapping when the bucket count changes.
pub fn jump_hash(mut key: u64, num_buckets: usize) -> usize {
  debug_assert!(num_buckets > 0);
  let mut bucket: i64 = -1;
  let mut jump: i64 = 0;
  while jump < num_buckets as i64 {
    bucket = jump;
    key = key.wrapping_mul(JUMP_HASH_MULTIPLIER).wrapping_add(1);
    jump = ((bucket + 1) as f64 * ((1u64 << 31) as f64 / (((key >> 33) + 1) as f64))) as i64;
  }
  bucket as usize
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum Strategy {
  Single,
  RoundRobin,
  JumpHash,
  LeastConnections,
}

impl Strategy {
  pub fn parse(value: Option<&str>) -> Result<Strategy, ProxyError> {
    match value {
      None | Some("single")     => Ok(Strategy::Single),
      Some("round-robin")       => Ok(Strategy::RoundRobin),
      Some("jump-hash")         => Ok(Strategy::JumpHash),
      Some("least-connections") => Ok(Strategy::LeastConnections),
      Some(other) => Err(ProxyError::Configuration(format!("unknown strategy: {}", other))),
    }
  }
}

/// Deterministic key derivation from the client address, with a time
/// based fallback when the peer address is unavailable.
fn jump_hash_key(client: Option<IpAddr>) -> u64 {
  match client {
    Some(IpAddr::V4(v4)) => u32::from(v4) as u64,
    Some(IpAddr::V6(v6)) => {
      let octets = v6.octets();
      let mut high = [0u8; 8];
      let mut low = [0u8; 8];
      high.copy_from_slice(&octets[..8]);
      low.copy_from_slice(&octets[8..]);
      u64::from_be_bytes(high) ^ u64::from_be_bytes(low)
    },
    None => now_nanos(),
  }
}

pub struct Balancer {
  pub name:     String,
  backends:     Vec<Arc<Backend>>,
  strategy:     Strategy,
  rr:           AtomicUsize,
  notify_tx:    SyncSender<StatusChange>,
  notify_rx:    Mutex<Option<Receiver<StatusChange>>>,
  dial_timeout: Duration,
}

impl Balancer {
  pub fn new(config: &BackendGroupConfig) -> Result<Balancer, ProxyError> {
    let strategy = Strategy::parse(config.strategy.as_deref())?;
    let mut backends = Vec::with_capacity(config.servers.len());
    for server in &config.servers {
      backends.push(Arc::new(Backend::new(server)?));
    }
    let (notify_tx, notify_rx) = sync_channel(NOTIFY_QUEUE_SIZE);
    Ok(Balancer {
      name:         config.name.clone(),
      backends,
      strategy,
      rr:           AtomicUsize::new(0),
      notify_tx,
      notify_rx:    Mutex::new(Some(notify_rx)),
      dial_timeout: DEFAULT_DIAL_TIMEOUT,
    })
  }

  /// Start the probes and the supervisor. Status transitions reach the
  /// orchestrator as `BackendStatus` events.
  pub fn start(&self, cancel: &CancellationToken, events: EventSender)
    -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::new();
    for backend in &self.backends {
      if let Some(handle) = backend.start(cancel, self.notify_tx.clone()) {
        handles.push(handle);
      }
    }

    let receiver = self.notify_rx.lock()
      .ok()
      .and_then(|mut slot| slot.take());
    if let Some(receiver) = receiver {
      let cancel = cancel.clone();
      let name = self.name.clone();
      let handle = thread::Builder::new()
        .name(format!("balancer-{}", name))
        .spawn(move || supervise(name, receiver, events, cancel))
        .expect("could not spawn the balancer supervisor thread");
      handles.push(handle);
    }
    handles
  }

  fn eligible(&self) -> Vec<&Arc<Backend>> {
    self.backends.iter()
      .filter(|backend| backend.status() != crate::backend::BackendState::Disabled)
      .collect()
  }

  /// Select a backend according to the strategy, skipping disabled ones.
  pub fn pick(&self, client: Option<IpAddr>) -> Result<Arc<Backend>, ProxyError> {
    let eligible = self.eligible();
    if eligible.is_empty() {
      return Err(ProxyError::NoActiveBackends);
    }
    let index = match self.strategy {
      Strategy::Single     => 0,
      Strategy::RoundRobin => self.rr.fetch_add(1, Ordering::SeqCst) % eligible.len(),
      Strategy::JumpHash   => jump_hash(jump_hash_key(client), eligible.len()),
      Strategy::LeastConnections => {
        eligible.iter()
          .enumerate()
          .min_by_key(|(index, backend)| (backend.connections(), *index))
          .map(|(index, _)| index)
          .unwrap_or(0)
      },
    };
    Ok(Arc::clone(eligible[index]))
  }

  /// Select and connect. The connection is non blocking and counted on
  /// the backend until the session closes.
  pub fn dial(&self, client: Option<IpAddr>)
    -> Result<(std::net::TcpStream, Arc<Backend>), ProxyError> {
    let backend = self.pick(client)?;
    let conn = backend.dial(self.dial_timeout)?;
    Ok((conn, backend))
  }

  #[cfg(test)]
  fn backend(&self, index: usize) -> &Arc<Backend> {
    &self.backends[index]
  }
}

fn supervise(name: String, receiver: Receiver<StatusChange>, events: EventSender,
  cancel: CancellationToken) {
  loop {
    if cancel.is_cancelled() {
      debug!("stopping supervisor of balancer {}", name);
      return;
    }
    match receiver.recv_timeout(SUPERVISOR_TICK) {
      Ok(change) => {
        let event = Event::new(ProxyEvent::BackendStatus {
          name:   change.name,
          status: change.status,
        });
        if events.send(event).is_err() {
          return;
        }
      },
      Err(RecvTimeoutError::Timeout)      => {},
      Err(RecvTimeoutError::Disconnected) => return,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::BackendState;
  use dynlb_command::config::{BackendConfig, Network};
  use rand::Rng;

  fn group(addresses: &[&str], strategy: Option<&str>) -> BackendGroupConfig {
    BackendGroupConfig {
      name:     String::from("g1"),
      strategy: strategy.map(String::from),
      servers:  addresses.iter().enumerate().map(|(i, address)| BackendConfig {
        name:                    format!("b{}", i),
        net:                     Network::Tcp,
        address:                 address.to_string(),
        health_check_period_sec: None,
      }).collect(),
    }
  }

  fn enable_all(balancer: &Balancer) {
    let cancel = CancellationToken::new();
    let (tx, _rx) = sync_channel(4);
    for backend in &balancer.backends {
      backend.start(&cancel, tx.clone());
    }
  }

  #[test]
  fn jump_hash_reference_vectors() {
    assert_eq!(jump_hash(0x1234_5678_9abc_def0, 10), 4);
    assert_eq!(jump_hash(0x1234_5678_9abc_def0, 100), 33);
    assert_eq!(jump_hash(1, 10), 6);
    assert_eq!(jump_hash(42, 7), 2);
    assert_eq!(jump_hash(0, 5), 0);
    // repeated calls stay stable
    assert_eq!(jump_hash(0x1234_5678_9abc_def0, 10), 4);
  }

  quickcheck! {
    fn jump_hash_stays_in_range(key: u64, buckets: usize) -> bool {
      let buckets = buckets % 1024 + 1;
      jump_hash(key, buckets) < buckets
    }

    fn jump_hash_is_deterministic(key: u64) -> bool {
      jump_hash(key, 20) == jump_hash(key, 20)
    }
  }

  #[test]
  fn jump_hash_minimal_remapping() {
    // growing n -> n+1 must move roughly 1/(n+1) of the keys
    let mut rng = rand::thread_rng();
    let samples = 20_000;
    let mut moved = 0;
    for _ in 0..samples {
      let key: u64 = rng.gen();
      if jump_hash(key, 10) != jump_hash(key, 11) {
        moved += 1;
      }
    }
    let fraction = moved as f64 / samples as f64;
    assert!(fraction < 2.0 / 11.0, "moved fraction too high: {}", fraction);
  }

  #[test]
  fn single_takes_first_eligible() {
    let balancer = Balancer::new(&group(&["127.0.0.1:1", "127.0.0.1:2"], None)).unwrap();
    enable_all(&balancer);
    assert_eq!(balancer.pick(None).unwrap().name, "b0");

    // first backend disabled, selection skips to the next one
    balancer.backend(0).force_status(BackendState::Disabled);
    assert_eq!(balancer.pick(None).unwrap().name, "b1");
  }

  #[test]
  fn round_robin_cycles() {
    let balancer = Balancer::new(&group(&["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"],
      Some("round-robin"))).unwrap();
    enable_all(&balancer);
    let picks: Vec<String> = (0..6).map(|_| balancer.pick(None).unwrap().name.clone()).collect();
    assert_eq!(picks, vec!["b0", "b1", "b2", "b0", "b1", "b2"]);
  }

  #[test]
  fn least_connections_breaks_ties_by_index() {
    let balancer = Balancer::new(&group(&["127.0.0.1:1", "127.0.0.1:2"],
      Some("least-connections"))).unwrap();
    enable_all(&balancer);
    assert_eq!(balancer.pick(None).unwrap().name, "b0");

    balancer.backend(0).inc_connections();
    assert_eq!(balancer.pick(None).unwrap().name, "b1");

    balancer.backend(1).inc_connections();
    assert_eq!(balancer.pick(None).unwrap().name, "b0");
  }

  #[test]
  fn jump_hash_pick_is_stable_per_client() {
    let balancer = Balancer::new(&group(&["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"],
      Some("jump-hash"))).unwrap();
    enable_all(&balancer);
    let client: IpAddr = "192.0.2.7".parse().unwrap();
    let first = balancer.pick(Some(client)).unwrap().name.clone();
    for _ in 0..10 {
      assert_eq!(balancer.pick(Some(client)).unwrap().name, first);
    }
  }

  #[test]
  fn all_disabled_is_no_active_backends() {
    let balancer = Balancer::new(&group(&["127.0.0.1:1"], None)).unwrap();
    balancer.backend(0).force_status(BackendState::Disabled);
    assert!(matches!(balancer.pick(None), Err(ProxyError::NoActiveBackends)));
    assert!(matches!(balancer.dial(None), Err(ProxyError::NoActiveBackends)));
  }

  #[test]
  fn unknown_status_is_eligible() {
    let balancer = Balancer::new(&group(&["127.0.0.1:1"], None)).unwrap();
    assert_eq!(balancer.backend(0).status(), BackendState::Unknown);
    assert!(balancer.pick(None).is_ok());
  }

  #[test]
  fn rejects_unknown_strategy() {
    assert!(Balancer::new(&group(&["127.0.0.1:1"], Some("hash-ring"))).is_err());
  }
}
