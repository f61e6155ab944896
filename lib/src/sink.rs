//! Outbound event sink.
//!
//! Operational events (backend transitions, OCSP failures, monitor
//! events) are serialized to JSON and published to a message bus topic.
//! The reference sink is a Kafka producer with required acks = one; when
//! no brokers are configured, or the producer cannot be created, events
//! go to the log instead. Publishing is decoupled from the orchestrator
//! by a bounded queue with a drop policy: the sink may lag, it may drop,
//! it must never block the proxy.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use kafka::producer::{Producer, Record, RequiredAcks};
use uuid::Uuid;

use dynlb_command::config::GlobalConfig;
use dynlb_command::event::{Event as WireEvent, EventKind};

use crate::error::ProxyError;
use crate::util::CancellationToken;
use crate::{Event, ProxyEvent};

/// Capacity of the sink queue; overflow drops the newest event.
const SINK_QUEUE_SIZE: usize = 256;

const SINK_TICK: Duration = Duration::from_millis(250);

const ACK_TIMEOUT: Duration = Duration::from_secs(1);

pub trait EventSink: Send {
  fn publish(&mut self, key: &str, event: &WireEvent) -> Result<(), ProxyError>;
}

pub struct KafkaEventSink {
  producer: Producer,
  topic:    String,
}

impl KafkaEventSink {
  pub fn new(brokers: Vec<String>, topic: String) -> Result<KafkaEventSink, ProxyError> {
    let producer = Producer::from_hosts(brokers)
      .with_ack_timeout(ACK_TIMEOUT)
      .with_required_acks(RequiredAcks::One)
      .create()
      .map_err(|e| ProxyError::Sink(e.to_string()))?;
    Ok(KafkaEventSink { producer, topic })
  }
}

impl EventSink for KafkaEventSink {
  fn publish(&mut self, key: &str, event: &WireEvent) -> Result<(), ProxyError> {
    let payload = serde_json::to_vec(event)
      .map_err(|e| ProxyError::Sink(e.to_string()))?;
    self.producer
      .send(&Record::from_key_value(&self.topic, key.as_bytes(), payload))
      .map_err(|e| ProxyError::Sink(e.to_string()))
  }
}

/// Fallback sink writing the JSON events to the log.
pub struct LogEventSink;

impl EventSink for LogEventSink {
  fn publish(&mut self, key: &str, event: &WireEvent) -> Result<(), ProxyError> {
    let payload = serde_json::to_string(event)
      .map_err(|e| ProxyError::Sink(e.to_string()))?;
    info!("event[{}]: {}", key, payload);
    Ok(())
  }
}

/// Producer side handle: converts internal events to their wire form and
/// queues them for the sender thread.
pub struct SinkHandle {
  queue:  SyncSender<(String, WireEvent)>,
  handle: Option<thread::JoinHandle<()>>,
}

impl SinkHandle {
  /// Build the sink described by the global configuration. Kafka when
  /// brokers and topic are given and reachable, the log otherwise.
  pub fn from_global(global: &GlobalConfig, cancel: CancellationToken) -> Option<SinkHandle> {
    let sink: Box<dyn EventSink> = match (&global.event_kafka_topic, global.kafka_brokers()) {
      (Some(topic), brokers) if !brokers.is_empty() => {
        match KafkaEventSink::new(brokers, topic.clone()) {
          Ok(sink) => Box::new(sink),
          Err(e) => {
            error!("could not create the kafka event sink: {}, falling back to the log", e);
            Box::new(LogEventSink)
          }
        }
      },
      _ => Box::new(LogEventSink),
    };
    Some(SinkHandle::spawn(sink, cancel))
  }

  pub fn spawn(sink: Box<dyn EventSink>, cancel: CancellationToken) -> SinkHandle {
    let (queue, receiver): (SyncSender<(String, WireEvent)>, Receiver<(String, WireEvent)>) =
      sync_channel(SINK_QUEUE_SIZE);
    let handle = thread::Builder::new()
      .name(String::from("event-sink"))
      .spawn(move || {
        let mut sink = sink;
        loop {
          match receiver.recv_timeout(SINK_TICK) {
            Ok((key, event)) => {
              if let Err(e) = sink.publish(&key, &event) {
                error!("could not publish event {}: {}", event.id, e);
              }
            },
            Err(RecvTimeoutError::Timeout) => {
              if cancel.is_cancelled() {
                return;
              }
            },
            Err(RecvTimeoutError::Disconnected) => return,
          }
        }
      })
      .expect("could not spawn the event sink thread");
    SinkHandle { queue, handle: Some(handle) }
  }

  /// Queue an event for publication; drops with a log line on overflow.
  pub fn forward(&self, event: &Event) {
    let converted = match wire_event(event) {
      Some(converted) => converted,
      None            => return,
    };
    match self.queue.try_send(converted) {
      Ok(())                             => {},
      Err(TrySendError::Full(_))         => {
        warn!("event sink queue full, dropping event");
      },
      Err(TrySendError::Disconnected(_)) => {},
    }
  }

  pub fn stop(self) {
    let SinkHandle { queue, handle } = self;
    // closing the queue is what lets the sender thread drain and exit
    drop(queue);
    if let Some(handle) = handle {
      if handle.join().is_err() {
        error!("event sink thread panicked");
      }
    }
  }
}

/// Internal event to wire event. New connections are operational churn,
/// not operator events, and stay off the bus.
fn wire_event(event: &Event) -> Option<(String, WireEvent)> {
  let (key, mut wire) = match &event.kind {
    ProxyEvent::NewConnection { .. } => return None,
    ProxyEvent::BackendStatus { name, status } => {
      let wire = WireEvent::new(name.clone(), EventKind::BackendStatus)
        .with_msg(format!("backend {} is now {}", name, status))
        .with_tags(vec![String::from("backend")]);
      (name.clone(), wire)
    },
    ProxyEvent::OcspValidationError { serial, error, msg } => {
      let wire = WireEvent::new(serial.clone(), EventKind::OcspValidationError)
        .with_msg(msg.clone())
        .with_error(error.clone())
        .with_tags(vec![String::from("ocsp")]);
      (serial.clone(), wire)
    },
    ProxyEvent::UnavailableOcspResponder { serial, error, msg } => {
      let wire = WireEvent::new(serial.clone(), EventKind::UnavailableOcspResponder)
        .with_msg(msg.clone())
        .with_error(error.clone())
        .with_tags(vec![String::from("ocsp")]);
      (serial.clone(), wire)
    },
    ProxyEvent::Monitor { tags, metadata } => {
      let id = Uuid::new_v4().to_hyphenated().to_string();
      let wire = WireEvent::new(id.clone(), EventKind::Monitor)
        .with_tags(tags.clone())
        .with_metadata(metadata.clone().into_iter().collect());
      (id, wire)
    },
  };
  wire.timestamp = event.at_ms;
  Some((key, wire))
}
