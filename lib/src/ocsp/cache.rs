//! Bounded TTL cache.
//!
//! Entries expire individually; lookups never return an expired value.
//! At capacity the insert first sweeps expired entries, then evicts the
//! entry closest to expiry, on the theory that what dies next is worth
//! the least.

use std::hash::Hash;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

struct InternalEntry<V> {
  value:      V,
  expires_at: Instant,
}

impl<V> InternalEntry<V> {
  fn is_expired(&self, now: Instant) -> bool {
    self.expires_at <= now
  }
}

pub struct TtlCache<K: Eq + Hash, V> {
  map:      HashMap<K, InternalEntry<V>>,
  capacity: usize,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
  pub fn new(capacity: usize) -> TtlCache<K, V> {
    TtlCache {
      map:      HashMap::new(),
      capacity: capacity.max(1),
    }
  }

  pub fn insert(&mut self, key: K, value: V, ttl: Duration) -> Option<V> {
    let now = Instant::now();
    if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
      self.map.retain(|_, entry| !entry.is_expired(now));
      if self.map.len() >= self.capacity {
        let doomed = self.map.iter()
          .min_by_key(|(_, entry)| entry.expires_at)
          .map(|(key, _)| key.clone());
        if let Some(doomed) = doomed {
          self.map.remove(&doomed);
        }
      }
    }
    self.map
      .insert(key, InternalEntry { value, expires_at: now + ttl })
      .map(|entry| entry.value)
  }

  pub fn get(&self, key: &K) -> Option<&V> {
    let now = Instant::now();
    self.map.get(key).and_then(|entry| {
      if entry.is_expired(now) {
        None
      } else {
        Some(&entry.value)
      }
    })
  }

  pub fn contains_key(&self, key: &K) -> bool {
    self.get(key).is_some()
  }

  pub fn remove(&mut self, key: &K) -> Option<V> {
    self.map.remove(key).map(|entry| entry.value)
  }

  /// Live entries; expired ones linger until touched but do not count.
  pub fn len(&self) -> usize {
    let now = Instant::now();
    self.map.values().filter(|entry| !entry.is_expired(now)).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&mut self) {
    self.map.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn returns_live_entries() {
    let mut cache = TtlCache::new(8);
    cache.insert("a", 1, Duration::from_secs(60));
    assert_eq!(cache.get(&"a"), Some(&1));
    assert!(cache.contains_key(&"a"));
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn expired_entries_disappear() {
    let mut cache = TtlCache::new(8);
    cache.insert("a", 1, Duration::from_millis(10));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(cache.get(&"a"), None);
    assert!(cache.is_empty());
  }

  #[test]
  fn capacity_evicts_soonest_to_expire() {
    let mut cache = TtlCache::new(2);
    cache.insert("short", 1, Duration::from_secs(1));
    cache.insert("long", 2, Duration::from_secs(600));
    cache.insert("new", 3, Duration::from_secs(300));

    assert_eq!(cache.get(&"short"), None);
    assert_eq!(cache.get(&"long"), Some(&2));
    assert_eq!(cache.get(&"new"), Some(&3));
  }

  #[test]
  fn reinserting_replaces_the_value() {
    let mut cache = TtlCache::new(2);
    cache.insert("a", 1, Duration::from_secs(60));
    let previous = cache.insert("a", 2, Duration::from_secs(60));
    assert_eq!(previous, Some(1));
    assert_eq!(cache.get(&"a"), Some(&2));
  }
}
