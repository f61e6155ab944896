//! Minimal DER subset for the OCSP wire format (RFC 6960).
//!
//! Requests are built with SHA-256 CertIDs and responses are walked with
//! a small tag/length/value reader; only the structures the validator
//! needs are understood. Certificate parsing itself is left to
//! x509-parser, this module only deals with the OCSP envelope.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::ProxyError;

// universal tags
pub const TAG_INTEGER: u8          = 0x02;
pub const TAG_BIT_STRING: u8       = 0x03;
pub const TAG_OCTET_STRING: u8     = 0x04;
pub const TAG_NULL: u8             = 0x05;
pub const TAG_OID: u8              = 0x06;
pub const TAG_ENUMERATED: u8       = 0x0a;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8         = 0x30;

// context specific tags used by the OCSP structures
pub const TAG_CTX_0: u8             = 0xa0;
pub const TAG_CTX_1: u8             = 0xa1;
pub const TAG_CTX_2: u8             = 0xa2;
pub const TAG_STATUS_GOOD: u8      = 0x80;
pub const TAG_STATUS_REVOKED: u8   = 0xa1;
pub const TAG_STATUS_UNKNOWN: u8   = 0x82;

/// id-sha256, 2.16.840.1.101.3.4.2.1
pub const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
/// id-pkix-ocsp-basic, 1.3.6.1.5.5.7.48.1.1
pub const OID_OCSP_BASIC: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

pub fn encode_len(out: &mut Vec<u8>, len: usize) {
  if len < 0x80 {
    out.push(len as u8);
  } else {
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
  }
}

pub fn wrap(tag: u8, content: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(content.len() + 4);
  out.push(tag);
  encode_len(&mut out, content.len());
  out.extend_from_slice(content);
  out
}

pub fn sequence(parts: &[&[u8]]) -> Vec<u8> {
  let mut content = Vec::new();
  for part in parts {
    content.extend_from_slice(part);
  }
  wrap(TAG_SEQUENCE, &content)
}

pub fn octet_string(content: &[u8]) -> Vec<u8> {
  wrap(TAG_OCTET_STRING, content)
}

pub fn oid(body: &[u8]) -> Vec<u8> {
  wrap(TAG_OID, body)
}

pub fn null() -> Vec<u8> {
  vec![TAG_NULL, 0x00]
}

/// INTEGER from unsigned big endian bytes, adding the leading zero DER
/// requires when the high bit is set.
pub fn integer(raw: &[u8]) -> Vec<u8> {
  let trimmed: &[u8] = {
    let skip = raw.iter().take_while(|b| **b == 0).count();
    if skip == raw.len() { &[0] } else { &raw[skip..] }
  };
  let mut content = Vec::with_capacity(trimmed.len() + 1);
  if trimmed[0] & 0x80 != 0 {
    content.push(0);
  }
  content.extend_from_slice(trimmed);
  wrap(TAG_INTEGER, &content)
}

pub fn generalized_time(at: DateTime<Utc>) -> Vec<u8> {
  let formatted = at.format("%Y%m%d%H%M%SZ").to_string();
  wrap(TAG_GENERALIZED_TIME, formatted.as_bytes())
}

/// CertID with SHA-256 hashes, the identity a request and its response
/// must agree on.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct CertId {
  pub issuer_name_hash: Vec<u8>,
  pub issuer_key_hash:  Vec<u8>,
  pub serial:           Vec<u8>,
}

impl CertId {
  fn encode(&self) -> Vec<u8> {
    let algorithm = sequence(&[&oid(OID_SHA256), &null()]);
    sequence(&[
      &algorithm,
      &octet_string(&self.issuer_name_hash),
      &octet_string(&self.issuer_key_hash),
      &integer(&self.serial),
    ])
  }
}

/// OCSPRequest with a single Request and no extensions, the same minimal
/// shape golang.org/x/crypto/ocsp emits.
pub fn encode_request(cert_id: &CertId) -> Vec<u8> {
  let request = sequence(&[&cert_id.encode()]);
  let request_list = sequence(&[&request]);
  let tbs_request = sequence(&[&request_list]);
  sequence(&[&tbs_request])
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum ResponseCertStatus {
  Good,
  Revoked,
  Unknown,
}

#[derive(Debug,Clone)]
pub struct ParsedResponse {
  pub cert_id:           CertId,
  pub status:            ResponseCertStatus,
  pub revocation_reason: Option<u32>,
  pub revoked_at:        Option<DateTime<Utc>>,
  pub produced_at:       DateTime<Utc>,
  pub this_update:       DateTime<Utc>,
  pub next_update:       Option<DateTime<Utc>>,
}

struct Reader<'a> {
  input: &'a [u8],
}

impl<'a> Reader<'a> {
  fn new(input: &'a [u8]) -> Reader<'a> {
    Reader { input }
  }

  fn is_empty(&self) -> bool {
    self.input.is_empty()
  }

  fn peek_tag(&self) -> Option<u8> {
    self.input.first().copied()
  }

  /// Read one TLV, returning the tag and the raw content.
  fn read(&mut self) -> Result<(u8, &'a [u8]), ProxyError> {
    if self.input.len() < 2 {
      return Err(ProxyError::OcspPayload(String::from("truncated DER element")));
    }
    let tag = self.input[0];
    let first = self.input[1];
    let (len, header) = if first < 0x80 {
      (first as usize, 2)
    } else {
      let len_bytes = (first & 0x7f) as usize;
      if len_bytes == 0 || len_bytes > 4 || self.input.len() < 2 + len_bytes {
        return Err(ProxyError::OcspPayload(String::from("unsupported DER length")));
      }
      let mut len = 0usize;
      for byte in &self.input[2..2 + len_bytes] {
        len = (len << 8) | *byte as usize;
      }
      (len, 2 + len_bytes)
    };
    if self.input.len() < header + len {
      return Err(ProxyError::OcspPayload(String::from("DER element longer than input")));
    }
    let content = &self.input[header..header + len];
    self.input = &self.input[header + len..];
    Ok((tag, content))
  }

  fn expect(&mut self, expected: u8) -> Result<&'a [u8], ProxyError> {
    let (tag, content) = self.read()?;
    if tag != expected {
      return Err(ProxyError::OcspPayload(format!(
        "unexpected DER tag {:#04x}, wanted {:#04x}", tag, expected)));
    }
    Ok(content)
  }

  /// Skip the next element when it carries the given tag.
  fn skip_optional(&mut self, tag: u8) -> Result<(), ProxyError> {
    if self.peek_tag() == Some(tag) {
      self.read()?;
    }
    Ok(())
  }
}

fn parse_time(content: &[u8]) -> Result<DateTime<Utc>, ProxyError> {
  let text = std::str::from_utf8(content)
    .map_err(|_| ProxyError::OcspPayload(String::from("invalid GeneralizedTime")))?;
  // strip the trailing Z and any fractional seconds
  let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
  if digits.len() < 14 {
    return Err(ProxyError::OcspPayload(format!("invalid GeneralizedTime: {}", text)));
  }
  let naive = NaiveDateTime::parse_from_str(&digits[..14], "%Y%m%d%H%M%S")
    .map_err(|_| ProxyError::OcspPayload(format!("invalid GeneralizedTime: {}", text)))?;
  Ok(Utc.from_utc_datetime(&naive))
}

fn parse_cert_id(content: &[u8]) -> Result<CertId, ProxyError> {
  let mut reader = Reader::new(content);
  // AlgorithmIdentifier, hash choice does not matter for matching
  reader.expect(TAG_SEQUENCE)?;
  let issuer_name_hash = reader.expect(TAG_OCTET_STRING)?.to_vec();
  let issuer_key_hash  = reader.expect(TAG_OCTET_STRING)?.to_vec();
  let serial_content   = reader.expect(TAG_INTEGER)?;
  let skip = serial_content.iter().take_while(|b| **b == 0).count();
  let serial = if skip == serial_content.len() {
    vec![0]
  } else {
    serial_content[skip..].to_vec()
  };
  Ok(CertId { issuer_name_hash, issuer_key_hash, serial })
}

/// Walk an OCSPResponse down to its first SingleResponse.
pub fn parse_response(input: &[u8]) -> Result<ParsedResponse, ProxyError> {
  let mut outer = Reader::new(Reader::new(input).expect(TAG_SEQUENCE)?);

  let status = outer.expect(TAG_ENUMERATED)?;
  if status != [0] {
    return Err(ProxyError::OcspPayload(format!(
      "responder returned error status {:?}", status)));
  }

  let response_bytes = outer.expect(TAG_CTX_0)?;
  let mut response_bytes = Reader::new(Reader::new(response_bytes).expect(TAG_SEQUENCE)?);
  let response_type = response_bytes.expect(TAG_OID)?;
  if response_type != OID_OCSP_BASIC {
    return Err(ProxyError::OcspPayload(String::from("unsupported response type")));
  }
  let basic = response_bytes.expect(TAG_OCTET_STRING)?;

  // BasicOCSPResponse, only tbsResponseData is of interest here
  let mut basic = Reader::new(Reader::new(basic).expect(TAG_SEQUENCE)?);
  let tbs = basic.expect(TAG_SEQUENCE)?;

  let mut tbs = Reader::new(tbs);
  tbs.skip_optional(TAG_CTX_0)?; // version, defaults to v1
  match tbs.peek_tag() {
    Some(TAG_CTX_1) | Some(TAG_CTX_2) => {
      tbs.read()?; // responderID
    },
    _ => return Err(ProxyError::OcspPayload(String::from("missing responderID"))),
  }
  let produced_at = parse_time(tbs.expect(TAG_GENERALIZED_TIME)?)?;

  let responses = tbs.expect(TAG_SEQUENCE)?;
  let mut responses = Reader::new(responses);
  let single = responses.expect(TAG_SEQUENCE)?;
  let mut single = Reader::new(single);

  let cert_id = parse_cert_id(single.expect(TAG_SEQUENCE)?)?;

  let (status_tag, status_content) = single.read()?;
  let (status, revocation_reason, revoked_at) = match status_tag {
    TAG_STATUS_GOOD    => (ResponseCertStatus::Good, None, None),
    TAG_STATUS_UNKNOWN => (ResponseCertStatus::Unknown, None, None),
    TAG_STATUS_REVOKED => {
      let mut revoked = Reader::new(status_content);
      let revoked_at = parse_time(revoked.expect(TAG_GENERALIZED_TIME)?)?;
      let reason = if revoked.peek_tag() == Some(TAG_CTX_0) {
        let reason_content = revoked.expect(TAG_CTX_0)?;
        let reason = Reader::new(reason_content).expect(TAG_ENUMERATED)?;
        reason.first().map(|byte| *byte as u32)
      } else {
        None
      };
      (ResponseCertStatus::Revoked, reason, Some(revoked_at))
    },
    other => {
      return Err(ProxyError::OcspPayload(format!("unknown certStatus tag {:#04x}", other)));
    }
  };

  let this_update = parse_time(single.expect(TAG_GENERALIZED_TIME)?)?;
  let next_update = if single.peek_tag() == Some(TAG_CTX_0) {
    let wrapped = single.expect(TAG_CTX_0)?;
    Some(parse_time(Reader::new(wrapped).expect(TAG_GENERALIZED_TIME)?)?)
  } else {
    None
  };

  Ok(ParsedResponse {
    cert_id,
    status,
    revocation_reason,
    revoked_at,
    produced_at,
    this_update,
    next_update,
  })
}

/// Build an OCSPResponse around a single status, used by the tests and
/// by nothing else; real responses come from a responder.
#[cfg(test)]
pub fn encode_response(cert_id: &CertId, status: ResponseCertStatus,
  produced_at: DateTime<Utc>, this_update: DateTime<Utc>,
  next_update: Option<DateTime<Utc>>) -> Vec<u8> {
  let cert_status = match status {
    ResponseCertStatus::Good    => vec![TAG_STATUS_GOOD, 0x00],
    ResponseCertStatus::Unknown => vec![TAG_STATUS_UNKNOWN, 0x00],
    ResponseCertStatus::Revoked => {
      let mut revoked_info = generalized_time(this_update);
      let reason = wrap(TAG_CTX_0, &wrap(TAG_ENUMERATED, &[1]));
      revoked_info.extend_from_slice(&reason);
      wrap(TAG_STATUS_REVOKED, &revoked_info)
    },
  };

  let mut single_parts: Vec<u8> = Vec::new();
  single_parts.extend_from_slice(&cert_id.encode());
  single_parts.extend_from_slice(&cert_status);
  single_parts.extend_from_slice(&generalized_time(this_update));
  if let Some(next_update) = next_update {
    single_parts.extend_from_slice(&wrap(TAG_CTX_0, &generalized_time(next_update)));
  }
  let single = wrap(TAG_SEQUENCE, &single_parts);

  let responses = sequence(&[&single]);
  // responderID byKey with an empty hash is enough for the parser
  let responder_id = wrap(TAG_CTX_2, &octet_string(&[0u8; 20]));
  let tbs = sequence(&[&responder_id, &generalized_time(produced_at), &responses]);

  let signature_algorithm = sequence(&[&oid(OID_SHA256), &null()]);
  let signature = wrap(TAG_BIT_STRING, &[0x00]);
  let basic = sequence(&[&tbs, &signature_algorithm, &signature]);

  let response = sequence(&[&oid(OID_OCSP_BASIC), &octet_string(&basic)]);
  let response_bytes = wrap(TAG_CTX_0, &response);
  let status_ok = wrap(TAG_ENUMERATED, &[0]);
  sequence(&[&status_ok, &response_bytes])
}
