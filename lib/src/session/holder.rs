use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;

use crate::session::{lock_session, SharedSession};
use crate::util::CancellationToken;

/// How often the housekeeper logs a table summary.
pub const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(20);

/// Thread safe table mapping raw descriptors to sessions.
///
/// A proxy session appears once per owned descriptor; adding and removing
/// touch all of a session's entries under a single write lock so the
/// table never shows a half inserted session. Lookups take the read lock.
#[derive(Clone)]
pub struct SessionHolder {
  sessions: Arc<RwLock<HashMap<RawFd, SharedSession>>>,
}

impl SessionHolder {
  pub fn new() -> SessionHolder {
    SessionHolder {
      sessions: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  pub fn find(&self, fd: RawFd) -> Option<SharedSession> {
    let sessions = match self.sessions.read() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    sessions.get(&fd).cloned()
  }

  pub fn add(&self, session: SharedSession) {
    let fds = lock_session(&session).fds();
    let mut sessions = match self.sessions.write() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    for fd in fds {
      sessions.insert(fd, session.clone());
    }
  }

  pub fn remove(&self, session: &SharedSession) {
    let fds = lock_session(session).fds();
    self.remove_fds(&fds);
  }

  pub fn remove_fds(&self, fds: &[RawFd]) {
    let mut sessions = match self.sessions.write() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    for fd in fds {
      sessions.remove(fd);
    }
  }

  /// Number of distinct sessions in the table.
  pub fn count(&self) -> usize {
    let sessions = match self.sessions.read() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let mut seen: Vec<*const ()> = sessions.values()
      .map(|session| Arc::as_ptr(session) as *const ())
      .collect();
    seen.sort();
    seen.dedup();
    seen.len()
  }

  /// Distinct sessions currently in the table.
  pub fn snapshot(&self) -> Vec<SharedSession> {
    let sessions = match self.sessions.read() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let mut result: Vec<SharedSession> = Vec::new();
    for session in sessions.values() {
      if !result.iter().any(|known| Arc::ptr_eq(known, session)) {
        result.push(session.clone());
      }
    }
    result
  }

  /// Empty the table and hand back the distinct sessions, used at
  /// shutdown to close everything in one place.
  pub fn drain(&self) -> Vec<SharedSession> {
    let mut sessions = match self.sessions.write() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let mut result: Vec<SharedSession> = Vec::new();
    for (_, session) in sessions.drain() {
      if !result.iter().any(|known| Arc::ptr_eq(known, &session)) {
        result.push(session);
      }
    }
    result
  }

  /// Periodic summary of the table, read lock only.
  pub fn start_housekeeper(&self, cancel: CancellationToken) -> thread::JoinHandle<()> {
    let holder = self.clone();
    thread::Builder::new()
      .name(String::from("housekeeper"))
      .spawn(move || {
        loop {
          if cancel.wait(HOUSEKEEPING_PERIOD) {
            return;
          }
          let sessions = holder.snapshot();
          debug!("total sessions: {}", sessions.len());
          for session in sessions {
            let session = lock_session(&session);
            let stats = session.stats();
            debug!("{:?} session:[{}] lastActiveTime: {} sent: {} received: {}",
              session.fds(), session.id(), stats.last_activity_ms,
              stats.sent_bytes, stats.received_bytes);
          }
        }
      })
      .expect("could not spawn the housekeeper thread")
  }
}

impl Default for SessionHolder {
  fn default() -> SessionHolder {
    SessionHolder::new()
  }
}
