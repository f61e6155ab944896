//! Asynchronous OCSP validation with a TTL cache and optional stapling.
//!
//! The hot path never waits on a responder: a cache miss spawns a short
//! lived refresh thread and returns the `LazyLoadStaple` sentinel, which
//! the TLS verifier treats as success for that handshake. The refresh
//! does the HTTP round trip, binds the response to the issuer by
//! recomputing the CertID hashes, checks the serial, publishes failure
//! events and fills the cache with TTL = nextUpdate - now.
//!
//! Stapling (`get_staple`) is synchronous; it only runs at startup when
//! certificates are loaded, never per connection.

pub mod cache;
pub mod der;

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use dynlb_command::config::FrontendConfig;

use crate::error::ProxyError;
use crate::ocsp::cache::TtlCache;
use crate::ocsp::der::{CertId, ParsedResponse, ResponseCertStatus};
use crate::{Event, EventSender, ProxyEvent};

pub const OCSP_MIME: &str = "application/ocsp-request";

/// HTTP timeout toward the responder.
const RESPONDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Cache TTL when the responder does not give a nextUpdate.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

const CACHE_CAPACITY: usize = 1024;

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum CertStatus {
  Good,
  Revoked,
  Unknown,
}

impl From<ResponseCertStatus> for CertStatus {
  fn from(status: ResponseCertStatus) -> CertStatus {
    match status {
      ResponseCertStatus::Good    => CertStatus::Good,
      ResponseCertStatus::Revoked => CertStatus::Revoked,
      ResponseCertStatus::Unknown => CertStatus::Unknown,
    }
  }
}

#[derive(Debug,Clone)]
pub struct OcspCacheEntry {
  pub serial:            String,
  pub status:            CertStatus,
  pub revocation_reason: Option<u32>,
  pub produced_at:       DateTime<Utc>,
  pub this_update:       DateTime<Utc>,
  pub next_update:       Option<DateTime<Utc>>,
  pub revoked_at:        Option<DateTime<Utc>>,
  pub raw_der:           Vec<u8>,
}

#[derive(Debug,Clone)]
pub struct OcspConfig {
  pub staple_enabled:       bool,
  pub validation_enabled:   bool,
  pub cache_enabled:        bool,
  pub auto_renewal_enabled: bool,
  pub responder_url:        String,
}

impl OcspConfig {
  /// Only frontends with an OCSP feature switched on carry a processor.
  pub fn from_frontend(config: &FrontendConfig) -> Option<OcspConfig> {
    let enabled = config.ocsp_staple_enabled || config.ocsp_validation_enabled;
    if !enabled {
      return None;
    }
    config.ocsp_responder_url.as_ref().map(|url| OcspConfig {
      staple_enabled:       config.ocsp_staple_enabled,
      validation_enabled:   config.ocsp_validation_enabled,
      cache_enabled:        config.ocsp_cache_enabled,
      auto_renewal_enabled: config.ocsp_auto_renewal_enabled,
      responder_url:        url.clone(),
    })
  }
}

#[derive(Clone)]
pub struct OcspProcessor {
  config: OcspConfig,
  cache:  Arc<Mutex<TtlCache<String, OcspCacheEntry>>>,
  agent:  ureq::Agent,
  events: EventSender,
}

impl OcspProcessor {
  pub fn new(config: OcspConfig, events: EventSender) -> OcspProcessor {
    let agent = ureq::AgentBuilder::new()
      .timeout(RESPONDER_TIMEOUT)
      .build();
    OcspProcessor {
      config,
      cache: Arc::new(Mutex::new(TtlCache::new(CACHE_CAPACITY))),
      agent,
      events,
    }
  }

  /// Certificate status check on the handshake path. Cache hits answer
  /// immediately; a miss schedules a background refresh and returns the
  /// `LazyLoadStaple` sentinel so the caller can decide to proceed.
  pub fn verify(&self, cert_der: &[u8], issuer_der: &[u8]) -> Result<(), ProxyError> {
    if !self.config.validation_enabled {
      return Ok(());
    }

    let serial = serial_hex(cert_der)?;
    if self.config.cache_enabled {
      let cache = lock_cache(&self.cache);
      if let Some(entry) = cache.get(&serial) {
        // guard against a mis-keyed entry
        if entry.serial != serial {
          return Err(ProxyError::IncorrectSerialNumber { expected: serial });
        }
        if entry.status == CertStatus::Revoked {
          return Err(ProxyError::RevokedCert { serial });
        }
        return Ok(());
      }
    }

    self.spawn_refresh(cert_der.to_vec(), issuer_der.to_vec());
    Err(ProxyError::LazyLoadStaple)
  }

  fn spawn_refresh(&self, cert_der: Vec<u8>, issuer_der: Vec<u8>) {
    let processor = self.clone();
    let result = thread::Builder::new()
      .name(String::from("ocsp-refresh"))
      .spawn(move || {
        if let Err(e) = processor.refresh(&cert_der, &issuer_der) {
          debug!("background OCSP refresh failed: {}", e);
        }
      });
    if let Err(e) = result {
      error!("could not spawn OCSP refresh thread: {}", e);
    }
  }

  /// Full OCSP round trip: request, POST, parse, check, cache.
  pub fn refresh(&self, cert_der: &[u8], issuer_der: &[u8])
    -> Result<OcspCacheEntry, ProxyError> {
    let serial = serial_hex(cert_der)?;
    let cert_id = cert_identity(cert_der, issuer_der)?;
    let request = der::encode_request(&cert_id);

    let raw = match self.post(&request) {
      Ok(raw) => raw,
      Err(e) => {
        warn!("OCSP responder {} unavailable: {}", self.config.responder_url, e);
        self.publish(ProxyEvent::UnavailableOcspResponder {
          serial: serial.clone(),
          error:  e.to_string(),
          msg:    format!("could not reach responder {}", self.config.responder_url),
        });
        return Err(e);
      }
    };

    let parsed = der::parse_response(&raw)?;
    let entry = self.check_response(&cert_id, &serial, parsed, raw)?;

    if self.config.cache_enabled {
      let ttl = entry.next_update
        .map(|next_update| {
          let seconds = (next_update - Utc::now()).num_seconds();
          if seconds > 0 { Duration::from_secs(seconds as u64) } else { Duration::from_secs(0) }
        })
        .unwrap_or(DEFAULT_TTL);
      if ttl > Duration::from_secs(0) {
        lock_cache(&self.cache).insert(serial, entry.clone(), ttl);
      } else {
        debug!("OCSP response for {} is already stale, not caching", entry.serial);
      }
    }

    Ok(entry)
  }

  fn check_response(&self, cert_id: &CertId, serial: &str, parsed: ParsedResponse,
    raw: Vec<u8>) -> Result<OcspCacheEntry, ProxyError> {
    if parsed.cert_id.issuer_name_hash != cert_id.issuer_name_hash
      || parsed.cert_id.issuer_key_hash != cert_id.issuer_key_hash {
      let error = ProxyError::OcspPayload(String::from("response CertID does not match the issuer"));
      self.publish(ProxyEvent::OcspValidationError {
        serial: serial.to_string(),
        error:  error.to_string(),
        msg:    String::from("OCSP response was issued for another CA"),
      });
      return Err(error);
    }

    if trim_leading_zeros(&parsed.cert_id.serial) != trim_leading_zeros(&cert_id.serial) {
      let error = ProxyError::IncorrectSerialNumber { expected: serial.to_string() };
      self.publish(ProxyEvent::OcspValidationError {
        serial: serial.to_string(),
        error:  error.to_string(),
        msg:    String::from("OCSP response serial does not match the certificate"),
      });
      return Err(error);
    }

    if parsed.status == ResponseCertStatus::Revoked {
      self.publish(ProxyEvent::OcspValidationError {
        serial: serial.to_string(),
        error:  ProxyError::RevokedCert { serial: serial.to_string() }.to_string(),
        msg:    String::from("certificate is revoked"),
      });
    }

    Ok(OcspCacheEntry {
      serial:            serial.to_string(),
      status:            parsed.status.into(),
      revocation_reason: parsed.revocation_reason,
      produced_at:       parsed.produced_at,
      this_update:       parsed.this_update,
      next_update:       parsed.next_update,
      revoked_at:        parsed.revoked_at,
      raw_der:           raw,
    })
  }

  /// Raw DER staple for the server certificate, fetched inline. Used
  /// during startup and certificate loading only.
  pub fn get_staple(&self, cert_der: &[u8], issuer_der: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let serial = serial_hex(cert_der)?;
    if self.config.cache_enabled {
      let cached = lock_cache(&self.cache).get(&serial).map(|entry| entry.raw_der.clone());
      if let Some(raw) = cached {
        if self.config.auto_renewal_enabled {
          // keep the staple fresh for the handshakes after this one
          self.spawn_refresh(cert_der.to_vec(), issuer_der.to_vec());
        }
        return Ok(raw);
      }
    }
    let entry = self.refresh(cert_der, issuer_der)?;
    if entry.status == CertStatus::Revoked {
      warn!("stapling a revoked response for certificate {}", serial);
    }
    Ok(entry.raw_der)
  }

  fn post(&self, request: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let response = self.agent
      .post(&self.config.responder_url)
      .set("Content-Type", OCSP_MIME)
      .send_bytes(request)
      .map_err(|e| ProxyError::OcspResponder(e.to_string()))?;

    let mut raw = Vec::new();
    response.into_reader()
      .read_to_end(&mut raw)
      .map_err(|e| ProxyError::OcspResponder(e.to_string()))?;
    Ok(raw)
  }

  fn publish(&self, event: ProxyEvent) {
    if self.events.send(Event::new(event)).is_err() {
      debug!("event channel closed, dropping OCSP event");
    }
  }
}

fn lock_cache(cache: &Arc<Mutex<TtlCache<String, OcspCacheEntry>>>)
  -> std::sync::MutexGuard<TtlCache<String, OcspCacheEntry>> {
  match cache.lock() {
    Ok(guard)     => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

fn trim_leading_zeros(serial: &[u8]) -> &[u8] {
  let skip = serial.iter().take_while(|byte| **byte == 0).count();
  if skip == serial.len() { &[0] } else { &serial[skip..] }
}

/// Hex encoded certificate serial, the cache and event key.
pub fn serial_hex(cert_der: &[u8]) -> Result<String, ProxyError> {
  let (_, cert) = X509Certificate::from_der(cert_der)
    .map_err(|e| ProxyError::Certificate(e.to_string()))?;
  Ok(hex::encode(trim_leading_zeros(cert.raw_serial())))
}

/// SHA-256 CertID binding the certificate to its issuer.
pub fn cert_identity(cert_der: &[u8], issuer_der: &[u8]) -> Result<CertId, ProxyError> {
  let (_, cert) = X509Certificate::from_der(cert_der)
    .map_err(|e| ProxyError::Certificate(e.to_string()))?;
  let (_, issuer) = X509Certificate::from_der(issuer_der)
    .map_err(|e| ProxyError::Certificate(e.to_string()))?;

  let issuer_name_hash = Sha256::digest(issuer.subject().as_raw()).to_vec();
  let issuer_key_hash =
    Sha256::digest(issuer.public_key().subject_public_key.data.as_ref()).to_vec();

  Ok(CertId {
    issuer_name_hash,
    issuer_key_hash,
    serial: cert.raw_serial().to_vec(),
  })
}

#[cfg(test)]
pub(crate) mod fixtures {
  use crate::ocsp::der::*;

  fn utc_time(text: &str) -> Vec<u8> {
    wrap(0x17, text.as_bytes())
  }

  fn bit_string(data: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(data.len() + 1);
    content.push(0x00);
    content.extend_from_slice(data);
    wrap(TAG_BIT_STRING, &content)
  }

  fn name(common_name: &str) -> Vec<u8> {
    // SEQUENCE { SET { SEQUENCE { id-at-commonName, UTF8String } } }
    let attribute = sequence(&[&oid(&[0x55, 0x04, 0x03]), &wrap(0x0c, common_name.as_bytes())]);
    let rdn = wrap(0x31, &attribute);
    wrap(TAG_SEQUENCE, &rdn)
  }

  /// Structurally valid, unsigned certificate: enough for x509-parser
  /// to extract serial, subject and SPKI.
  pub fn certificate(serial: &[u8], subject_cn: &str, key_seed: u8) -> Vec<u8> {
    let version = wrap(TAG_CTX_0, &integer(&[2]));
    // sha256WithRSAEncryption
    let signature_algorithm = sequence(&[
      &oid(&[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]), &null()]);
    let validity = sequence(&[&utc_time("200101000000Z"), &utc_time("400101000000Z")]);
    // rsaEncryption with an opaque key blob
    let spki_algorithm = sequence(&[
      &oid(&[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01]), &null()]);
    let key_blob = vec![key_seed; 64];
    let spki = sequence(&[&spki_algorithm, &bit_string(&key_blob)]);

    let tbs = sequence(&[
      &version,
      &integer(serial),
      &signature_algorithm,
      &name("dynlb test ca"),
      &validity,
      &name(subject_cn),
      &spki,
    ]);

    sequence(&[&tbs, &signature_algorithm, &bit_string(&[0xde, 0xad, 0xbe, 0xef])])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ocsp::der::{encode_response, ResponseCertStatus};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::mpsc::sync_channel;
  use std::time::Instant;

  fn test_config(url: &str) -> OcspConfig {
    OcspConfig {
      staple_enabled:       true,
      validation_enabled:   true,
      cache_enabled:        true,
      auto_renewal_enabled: false,
      responder_url:        url.to_string(),
    }
  }

  fn certs() -> (Vec<u8>, Vec<u8>) {
    let cert = fixtures::certificate(&[0x01, 0xf2, 0x42], "client", 0x33);
    let issuer = fixtures::certificate(&[0x07], "dynlb test ca", 0x44);
    (cert, issuer)
  }

  /// Serve a canned DER body for every request and count the hits.
  fn responder(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let url = format!("http://{}", server.server_addr());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    std::thread::spawn(move || {
      for request in server.incoming_requests() {
        counter.fetch_add(1, Ordering::SeqCst);
        let response = tiny_http::Response::from_data(body.clone());
        let _ = request.respond(response);
      }
    });
    (url, hits)
  }

  fn good_response(cert: &[u8], issuer: &[u8]) -> Vec<u8> {
    let cert_id = cert_identity(cert, issuer).unwrap();
    let now = Utc::now();
    encode_response(&cert_id, ResponseCertStatus::Good, now, now,
      Some(now + chrono::Duration::hours(2)))
  }

  #[test]
  fn validation_disabled_short_circuits() {
    let (cert, issuer) = certs();
    let (tx, _rx) = sync_channel(16);
    let mut config = test_config("http://127.0.0.1:1");
    config.validation_enabled = false;
    let processor = OcspProcessor::new(config, tx);
    processor.verify(&cert, &issuer).unwrap();
  }

  #[test]
  fn cache_miss_is_lazy_and_warms_in_background() {
    let (cert, issuer) = certs();
    let (url, hits) = responder(good_response(&cert, &issuer));
    let (tx, _rx) = sync_channel(16);
    let processor = OcspProcessor::new(test_config(&url), tx);

    assert!(matches!(processor.verify(&cert, &issuer), Err(ProxyError::LazyLoadStaple)));

    // the background refresh fills the cache
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
      match processor.verify(&cert, &issuer) {
        Ok(()) => break,
        Err(ProxyError::LazyLoadStaple) if Instant::now() < deadline => {
          std::thread::sleep(Duration::from_millis(20));
        },
        other => panic!("unexpected verify result: {:?}", other.err()),
      }
    }
    // a cached hit does not go back to the responder
    let settled = hits.load(Ordering::SeqCst);
    processor.verify(&cert, &issuer).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), settled);
  }

  #[test]
  fn refresh_populates_and_verify_uses_cache() {
    let (cert, issuer) = certs();
    let (url, hits) = responder(good_response(&cert, &issuer));
    let (tx, _rx) = sync_channel(16);
    let processor = OcspProcessor::new(test_config(&url), tx);

    let entry = processor.refresh(&cert, &issuer).unwrap();
    assert_eq!(entry.status, CertStatus::Good);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    processor.verify(&cert, &issuer).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn revoked_response_fails_closed() {
    let (cert, issuer) = certs();
    let cert_id = cert_identity(&cert, &issuer).unwrap();
    let now = Utc::now();
    let revoked = encode_response(&cert_id, ResponseCertStatus::Revoked, now, now,
      Some(now + chrono::Duration::hours(2)));
    let (url, _hits) = responder(revoked);
    let (tx, rx) = sync_channel(16);
    let processor = OcspProcessor::new(test_config(&url), tx);

    let entry = processor.refresh(&cert, &issuer).unwrap();
    assert_eq!(entry.status, CertStatus::Revoked);
    assert!(entry.revoked_at.is_some());

    // the cache keeps the revoked entry and the verifier fails closed
    assert!(matches!(processor.verify(&cert, &issuer), Err(ProxyError::RevokedCert { .. })));

    let event = rx.try_recv().unwrap();
    assert!(matches!(event.kind, ProxyEvent::OcspValidationError { .. }));
  }

  #[test]
  fn serial_mismatch_is_rejected() {
    let (cert, issuer) = certs();
    let other_cert = fixtures::certificate(&[0x55, 0x66], "client", 0x33);
    // response created for another serial under the same issuer
    let response = good_response(&other_cert, &issuer);
    let (url, _hits) = responder(response);
    let (tx, rx) = sync_channel(16);
    let processor = OcspProcessor::new(test_config(&url), tx);

    assert!(matches!(processor.refresh(&cert, &issuer),
      Err(ProxyError::IncorrectSerialNumber { .. })));
    let event = rx.try_recv().unwrap();
    assert!(matches!(event.kind, ProxyEvent::OcspValidationError { .. }));
  }

  #[test]
  fn unreachable_responder_publishes_event() {
    let (cert, issuer) = certs();
    let (tx, rx) = sync_channel(16);
    // nothing listens there
    let processor = OcspProcessor::new(test_config("http://127.0.0.1:9"), tx);

    assert!(processor.refresh(&cert, &issuer).is_err());
    let event = rx.try_recv().unwrap();
    assert!(matches!(event.kind, ProxyEvent::UnavailableOcspResponder { .. }));
  }

  #[test]
  fn staple_round_trips_once_and_caches() {
    let (cert, issuer) = certs();
    let body = good_response(&cert, &issuer);
    let (url, hits) = responder(body.clone());
    let (tx, _rx) = sync_channel(16);
    let processor = OcspProcessor::new(test_config(&url), tx);

    let staple = processor.get_staple(&cert, &issuer).unwrap();
    assert_eq!(staple, body);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let again = processor.get_staple(&cert, &issuer).unwrap();
    assert_eq!(again, body);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn serial_hex_trims_padding() {
    let cert = fixtures::certificate(&[0x00, 0x8f], "client", 0x33);
    assert_eq!(serial_hex(&cert).unwrap(), "8f");
  }
}
