use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;

pub fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

/// Nanosecond clock reading, used as a jump hash seed when no client
/// address is available.
pub fn now_nanos() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(0)
}

/// Raise the soft RLIMIT_NOFILE toward the given target. A proxy holds
/// two descriptors per session so the inherited 1024 default runs out
/// quickly. Failure is logged and otherwise ignored.
pub fn raise_nofile_limit(soft: u64, hard: u64) {
  let mut current = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
  let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut current) };
  if ret != 0 {
    error!("could not read RLIMIT_NOFILE: {}", std::io::Error::last_os_error());
    return;
  }

  let wanted = libc::rlimit {
    rlim_cur: soft,
    rlim_max: hard.max(current.rlim_max),
  };
  let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &wanted) };
  if ret != 0 {
    // common when running unprivileged, keep going with what we have
    error!("could not raise RLIMIT_NOFILE to {}/{}: {}", soft, hard,
      std::io::Error::last_os_error());
  } else {
    info!("RLIMIT_NOFILE raised from {}/{} to {}/{}",
      current.rlim_cur, current.rlim_max, wanted.rlim_cur, wanted.rlim_max);
  }
}

/// Cooperative cancellation shared by every auxiliary task.
///
/// Tasks block in `wait` for their tick period and observe cancellation
/// within one tick, which is the shutdown contract of the proxy.
#[derive(Clone)]
pub struct CancellationToken {
  inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
  pub fn new() -> CancellationToken {
    CancellationToken {
      inner: Arc::new((Mutex::new(false), Condvar::new())),
    }
  }

  pub fn cancel(&self) {
    let (lock, condvar) = &*self.inner;
    if let Ok(mut cancelled) = lock.lock() {
      *cancelled = true;
    }
    condvar.notify_all();
  }

  pub fn is_cancelled(&self) -> bool {
    let (lock, _) = &*self.inner;
    lock.lock().map(|cancelled| *cancelled).unwrap_or(true)
  }

  /// Sleep up to `timeout`, returning true if cancellation happened.
  pub fn wait(&self, timeout: Duration) -> bool {
    let (lock, condvar) = &*self.inner;
    let deadline = std::time::Instant::now() + timeout;
    let mut cancelled = match lock.lock() {
      Ok(guard) => guard,
      Err(_)    => return true,
    };
    while !*cancelled {
      let now = std::time::Instant::now();
      if now >= deadline {
        return false;
      }
      let (guard, _) = match condvar.wait_timeout(cancelled, deadline - now) {
        Ok(r)  => r,
        Err(_) => return true,
      };
      cancelled = guard;
    }
    true
  }
}

impl Default for CancellationToken {
  fn default() -> CancellationToken {
    CancellationToken::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn wait_times_out_without_cancel() {
    let token = CancellationToken::new();
    assert!(!token.wait(Duration::from_millis(20)));
    assert!(!token.is_cancelled());
  }

  #[test]
  fn wait_returns_on_cancel() {
    let token = CancellationToken::new();
    let waiter = token.clone();
    let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(10));
    token.cancel();
    assert!(handle.join().unwrap());
    assert!(token.is_cancelled());
  }

  #[test]
  fn now_ms_is_monotonic_enough() {
    let a = now_ms();
    let b = now_ms();
    assert!(b >= a);
  }
}
