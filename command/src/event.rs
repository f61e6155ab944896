//! Serializable operational events.
//!
//! These are the messages the event sink publishes to the message bus,
//! JSON encoded. The proxy library keeps its own richer internal event
//! type; only what operators consume crosses the wire.

use std::collections::HashMap;

use chrono::Utc;

#[derive(Debug,Clone,Copy,PartialEq,Eq,Serialize,Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  BackendStatus,
  OcspValidationError,
  UnavailableOcspResponder,
  Monitor,
}

#[derive(Debug,Clone,PartialEq,Serialize,Deserialize)]
pub struct Event {
  pub id:        String,
  /// unix timestamp in milliseconds
  pub timestamp: i64,
  #[serde(rename = "type")]
  pub kind:      EventKind,
  #[serde(rename = "metaData", default)]
  pub metadata:  HashMap<String, String>,
  #[serde(default)]
  pub tags:      Vec<String>,
  #[serde(default)]
  pub error:     Option<String>,
  #[serde(default)]
  pub msg:       String,
}

impl Event {
  pub fn new(id: String, kind: EventKind) -> Event {
    Event {
      id,
      timestamp: Utc::now().timestamp_millis(),
      kind,
      metadata:  HashMap::new(),
      tags:      Vec::new(),
      error:     None,
      msg:       String::new(),
    }
  }

  pub fn with_msg(mut self, msg: String) -> Event {
    self.msg = msg;
    self
  }

  pub fn with_error(mut self, error: String) -> Event {
    self.error = Some(error);
    self
  }

  pub fn with_tags(mut self, tags: Vec<String>) -> Event {
    self.tags = tags;
    self
  }

  pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Event {
    self.metadata = metadata;
    self
  }
}
