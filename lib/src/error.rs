//! Error taxonomy of the proxy.
//!
//! `ClosedStream` and `ClosedSession` are expected termination sentinels:
//! the former means a peer finished cleanly and the session should be torn
//! down, the latter means the handler already closed the session and the
//! event loop only has to unregister and forget it. `LazyLoadStaple` is a
//! soft sentinel letting a TLS handshake proceed while the OCSP cache
//! warms in the background.

use std::io;

use thiserror::Error;

#[derive(Debug,Error)]
pub enum ProxyError {
  #[error("no active backends")]
  NoActiveBackends,

  #[error("invalid balancer name: {0}")]
  BalancerNotFound(String),

  #[error("no session found")]
  NoSessionFound,

  #[error("closed session")]
  ClosedSession,

  #[error("closed stream")]
  ClosedStream,

  #[error("certificate {serial} is revoked")]
  RevokedCert { serial: String },

  #[error("ocsp response serial does not match certificate serial {expected}")]
  IncorrectSerialNumber { expected: String },

  #[error("ocsp staple not cached yet, loading in background")]
  LazyLoadStaple,

  #[error("ocsp responder unavailable: {0}")]
  OcspResponder(String),

  #[error("invalid ocsp payload: {0}")]
  OcspPayload(String),

  #[error("certificate error: {0}")]
  Certificate(String),

  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("event sink error: {0}")]
  Sink(String),

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl ProxyError {
  pub fn is_closed_session(&self) -> bool {
    matches!(self, ProxyError::ClosedSession)
  }

  pub fn is_closed_stream(&self) -> bool {
    matches!(self, ProxyError::ClosedStream)
  }
}
