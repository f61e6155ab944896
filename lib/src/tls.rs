//! TLS configuration of a frontend.
//!
//! Builds the rustls `ServerConfig` out of the configured CA, certificate
//! and key paths: client authentication is require-and-verify against the
//! CA pool, the certificate resolver always hands out the configured
//! certified key (with an OCSP staple when stapling is on), and the
//! client certificate verifier chains the standard webpki checks with the
//! OCSP validator. A `LazyLoadStaple` answer from the validator lets the
//! handshake proceed while the cache warms; everything else OCSP reports
//! fails the handshake.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::internal::pemfile;
use rustls::sign::{any_supported_type, CertifiedKey};
use rustls::{AllowAnyAuthenticatedClient, Certificate, ClientCertVerified, ClientCertVerifier,
  ClientHello, DistinguishedNames, NoClientAuth, PrivateKey, ResolvesServerCert, RootCertStore,
  ServerConfig, TLSError};
use webpki::DNSName;

use crate::error::ProxyError;
use crate::ocsp::OcspProcessor;

#[derive(Debug,Clone)]
pub struct TlsSettings {
  pub skip_verify:  bool,
  pub ca_cert_path: String,
  pub cert_path:    String,
  pub key_path:     String,
}

pub fn load_certs(path: &str) -> Result<Vec<Certificate>, ProxyError> {
  let file = File::open(path)
    .map_err(|e| ProxyError::Certificate(format!("could not open {}: {}", path, e)))?;
  let certs = pemfile::certs(&mut BufReader::new(file))
    .map_err(|_| ProxyError::Certificate(format!("could not parse certificates in {}", path)))?;
  if certs.is_empty() {
    return Err(ProxyError::Certificate(format!("no certificate found in {}", path)));
  }
  Ok(certs)
}

pub fn load_private_key(path: &str) -> Result<PrivateKey, ProxyError> {
  let file = File::open(path)
    .map_err(|e| ProxyError::Certificate(format!("could not open {}: {}", path, e)))?;
  let mut reader = BufReader::new(file);
  if let Ok(mut keys) = pemfile::pkcs8_private_keys(&mut reader) {
    if !keys.is_empty() {
      return Ok(keys.remove(0));
    }
  }

  let file = File::open(path)
    .map_err(|e| ProxyError::Certificate(format!("could not open {}: {}", path, e)))?;
  let mut reader = BufReader::new(file);
  let mut keys = pemfile::rsa_private_keys(&mut reader)
    .map_err(|_| ProxyError::Certificate(format!("could not parse private key in {}", path)))?;
  if keys.is_empty() {
    return Err(ProxyError::Certificate(format!("no private key found in {}", path)));
  }
  Ok(keys.remove(0))
}

/// Always resolves to the configured certified key; the optional OCSP
/// staple rides along in the `CertifiedKey`.
struct FrontendCertResolver {
  certified: CertifiedKey,
}

impl ResolvesServerCert for FrontendCertResolver {
  fn resolve(&self, _client_hello: ClientHello) -> Option<CertifiedKey> {
    Some(self.certified.clone())
  }
}

/// Chain verification through the wrapped verifier, then certificate
/// status through OCSP. The issuer handed to the validator is the next
/// certificate of the presented chain, falling back to the configured CA
/// for a bare leaf.
pub struct OcspClientVerifier {
  inner:     Arc<dyn ClientCertVerifier>,
  processor: Option<Arc<OcspProcessor>>,
  ca_der:    Vec<u8>,
}

impl OcspClientVerifier {
  pub fn new(inner: Arc<dyn ClientCertVerifier>, processor: Option<Arc<OcspProcessor>>,
    ca_der: Vec<u8>) -> OcspClientVerifier {
    OcspClientVerifier { inner, processor, ca_der }
  }
}

impl ClientCertVerifier for OcspClientVerifier {
  fn offer_client_auth(&self) -> bool {
    self.inner.offer_client_auth()
  }

  fn client_auth_root_subjects(&self, sni: Option<&DNSName>) -> Option<DistinguishedNames> {
    self.inner.client_auth_root_subjects(sni)
  }

  fn verify_client_cert(&self, presented_certs: &[Certificate], sni: Option<&DNSName>)
    -> Result<ClientCertVerified, TLSError> {
    self.inner.verify_client_cert(presented_certs, sni)?;

    let processor = match &self.processor {
      Some(processor) => processor,
      None            => return Ok(ClientCertVerified::assertion()),
    };
    let leaf = match presented_certs.first() {
      Some(leaf) => leaf,
      None       => return Err(TLSError::NoCertificatesPresented),
    };
    let issuer: &[u8] = presented_certs.get(1)
      .map(|cert| cert.0.as_slice())
      .unwrap_or(&self.ca_der);

    match processor.verify(&leaf.0, issuer) {
      Ok(())                             => Ok(ClientCertVerified::assertion()),
      // soft fail-open: the cache warms in the background, the next
      // handshake gets a definite answer
      Err(ProxyError::LazyLoadStaple)    => Ok(ClientCertVerified::assertion()),
      Err(error) => {
        warn!("rejecting client certificate: {}", error);
        Err(TLSError::General(error.to_string()))
      }
    }
  }
}

/// Build the full server side TLS configuration for one frontend.
pub fn build_server_config(settings: &TlsSettings, ocsp: Option<Arc<OcspProcessor>>,
  staple_enabled: bool) -> Result<Arc<ServerConfig>, ProxyError> {
  let ca_certs = load_certs(&settings.ca_cert_path)?;
  let ca_der = ca_certs[0].0.clone();

  let verifier: Arc<dyn ClientCertVerifier> = if settings.skip_verify {
    NoClientAuth::new()
  } else {
    let mut roots = RootCertStore::empty();
    for cert in &ca_certs {
      roots.add(cert)
        .map_err(|e| ProxyError::Certificate(format!("invalid CA certificate: {:?}", e)))?;
    }
    Arc::new(OcspClientVerifier::new(
      AllowAnyAuthenticatedClient::new(roots),
      ocsp.clone(),
      ca_der.clone(),
    ))
  };

  let mut config = ServerConfig::new(verifier);

  let cert_chain = load_certs(&settings.cert_path)?;
  let key = load_private_key(&settings.key_path)?;
  let signing_key = any_supported_type(&key)
    .map_err(|_| ProxyError::Certificate(format!("unsupported private key in {}", settings.key_path)))?;

  let mut certified = CertifiedKey::new(cert_chain.clone(), Arc::new(signing_key));
  if staple_enabled {
    if let Some(processor) = &ocsp {
      let staple = processor.get_staple(&cert_chain[0].0, &ca_der)?;
      certified.ocsp = Some(staple);
    }
  }

  config.cert_resolver = Arc::new(FrontendCertResolver { certified });
  Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ocsp::der::{encode_response, ResponseCertStatus};
  use crate::ocsp::{cert_identity, fixtures, OcspConfig};
  use chrono::Utc;
  use std::sync::mpsc::sync_channel;

  /// Stand-in for the webpki chain verifier so the OCSP wrapping logic
  /// can be exercised with synthetic certificates.
  struct ApproveAll;

  impl ClientCertVerifier for ApproveAll {
    fn offer_client_auth(&self) -> bool {
      true
    }
    fn client_auth_root_subjects(&self) -> DistinguishedNames {
      DistinguishedNames::new()
    }
    fn verify_client_cert(&self, _presented_certs: &[Certificate])
      -> Result<ClientCertVerified, TLSError> {
      Ok(ClientCertVerified::assertion())
    }
  }

  fn processor(url: &str) -> (Arc<OcspProcessor>, std::sync::mpsc::Receiver<crate::Event>) {
    let (tx, rx) = sync_channel(16);
    let processor = Arc::new(OcspProcessor::new(OcspConfig {
      staple_enabled:       false,
      validation_enabled:   true,
      cache_enabled:        true,
      auto_renewal_enabled: false,
      responder_url:        url.to_string(),
    }, tx));
    (processor, rx)
  }

  fn responder(body: Vec<u8>) -> String {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let url = format!("http://{}", server.server_addr());
    std::thread::spawn(move || {
      for request in server.incoming_requests() {
        let _ = request.respond(tiny_http::Response::from_data(body.clone()));
      }
    });
    url
  }

  #[test]
  fn lazy_staple_lets_the_handshake_proceed() {
    let cert = fixtures::certificate(&[0x10], "client", 0x01);
    let issuer = fixtures::certificate(&[0x07], "dynlb test ca", 0x02);
    let cert_id = cert_identity(&cert, &issuer).unwrap();
    let now = Utc::now();
    let url = responder(encode_response(&cert_id, ResponseCertStatus::Good, now, now,
      Some(now + chrono::Duration::hours(1))));

    let (processor, _events) = processor(&url);
    let verifier = OcspClientVerifier::new(Arc::new(ApproveAll),
      Some(processor), issuer.clone());

    // empty cache: first handshake is allowed through
    let presented = vec![Certificate(cert), Certificate(issuer)];
    assert!(verifier.verify_client_cert(&presented).is_ok());
  }

  #[test]
  fn revoked_certificate_fails_the_handshake() {
    let cert = fixtures::certificate(&[0x11], "client", 0x01);
    let issuer = fixtures::certificate(&[0x07], "dynlb test ca", 0x02);
    let cert_id = cert_identity(&cert, &issuer).unwrap();
    let now = Utc::now();
    let url = responder(encode_response(&cert_id, ResponseCertStatus::Revoked, now, now,
      Some(now + chrono::Duration::hours(1))));

    let (processor, _events) = processor(&url);
    // prime the cache with the revoked answer
    processor.refresh(&cert, &issuer).unwrap();

    let verifier = OcspClientVerifier::new(Arc::new(ApproveAll),
      Some(processor), issuer.clone());
    let presented = vec![Certificate(cert), Certificate(issuer)];
    assert!(verifier.verify_client_cert(&presented).is_err());
  }

  #[test]
  fn no_processor_means_chain_checks_only() {
    let cert = fixtures::certificate(&[0x12], "client", 0x01);
    let verifier = OcspClientVerifier::new(Arc::new(ApproveAll), None, Vec::new());
    let presented = vec![Certificate(cert)];
    assert!(verifier.verify_client_cert(&presented).is_ok());
  }

  #[test]
  fn missing_certificate_file_is_an_error() {
    assert!(load_certs("/nonexistent/cert.pem").is_err());
    assert!(load_private_key("/nonexistent/key.pem").is_err());
  }
}
