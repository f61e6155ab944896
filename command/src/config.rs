//! Configuration model for the proxy.
//!
//! A configuration file describes the global options, the frontends the
//! proxy listens on and the named backend groups it balances over. The
//! format is discriminated by the file extension: `.toml` is parsed with
//! the toml crate, `.yaml`/`.yml` with serde_yaml.

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;

use log::LevelFilter;

#[derive(Debug,Clone,Copy,PartialEq,Eq,Serialize,Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warn,
  Info,
  Debug,
  Trace,
  Disabled,
}

impl Default for LogLevel {
  fn default() -> LogLevel {
    LogLevel::Info
  }
}

impl LogLevel {
  pub fn to_filter(self) -> LevelFilter {
    match self {
      LogLevel::Error    => LevelFilter::Error,
      LogLevel::Warn     => LevelFilter::Warn,
      LogLevel::Info     => LevelFilter::Info,
      LogLevel::Debug    => LevelFilter::Debug,
      LogLevel::Trace    => LevelFilter::Trace,
      LogLevel::Disabled => LevelFilter::Off,
    }
  }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq,Serialize,Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
  Tcp,
  Udp,
}

impl Default for Network {
  fn default() -> Network {
    Network::Tcp
  }
}

impl fmt::Display for Network {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Network::Tcp => write!(f, "tcp"),
      Network::Udp => write!(f, "udp"),
    }
  }
}

fn default_log_timestamp() -> bool {
  true
}

#[derive(Debug,Clone,PartialEq,Default,Serialize,Deserialize)]
pub struct GlobalConfig {
  #[serde(default)]
  pub log_level:           LogLevel,
  #[serde(default = "default_log_timestamp")]
  pub log_timestamp:       bool,
  /// comma separated list of kafka brokers for the event sink
  #[serde(default)]
  pub event_kafka_brokers: Option<String>,
  #[serde(default)]
  pub event_kafka_topic:   Option<String>,
}

impl GlobalConfig {
  pub fn kafka_brokers(&self) -> Vec<String> {
    self.event_kafka_brokers
      .as_ref()
      .map(|brokers| {
        brokers.split(',')
          .map(|broker| broker.trim().to_string())
          .filter(|broker| !broker.is_empty())
          .collect()
      })
      .unwrap_or_default()
  }
}

#[derive(Debug,Clone,PartialEq,Serialize,Deserialize)]
pub struct FrontendConfig {
  pub name:                      String,
  #[serde(default)]
  pub net:                       Network,
  pub address:                   String,
  pub backend_group:             String,
  #[serde(default)]
  pub tls_skip_verify:           bool,
  #[serde(default)]
  pub tls_ca_cert_path:          Option<String>,
  #[serde(default)]
  pub tls_cert_path:             Option<String>,
  #[serde(default)]
  pub tls_pk_path:               Option<String>,
  #[serde(default)]
  pub ocsp_staple_enabled:       bool,
  #[serde(default)]
  pub ocsp_validation_enabled:   bool,
  #[serde(default)]
  pub ocsp_cache_enabled:        bool,
  #[serde(default)]
  pub ocsp_auto_renewal_enabled: bool,
  #[serde(default)]
  pub ocsp_responder_url:        Option<String>,
}

impl FrontendConfig {
  /// TLS is configured when a certificate and key are both given.
  pub fn has_tls(&self) -> bool {
    self.tls_cert_path.is_some() && self.tls_pk_path.is_some()
  }
}

#[derive(Debug,Clone,PartialEq,Serialize,Deserialize)]
pub struct BackendConfig {
  pub name:                    String,
  #[serde(default)]
  pub net:                     Network,
  pub address:                 String,
  #[serde(default)]
  pub health_check_period_sec: Option<u64>,
}

#[derive(Debug,Clone,PartialEq,Serialize,Deserialize)]
pub struct BackendGroupConfig {
  pub name:     String,
  /// selection strategy: single, round-robin, jump-hash or least-connections
  #[serde(default)]
  pub strategy: Option<String>,
  pub servers:  Vec<BackendConfig>,
}

#[derive(Debug,Clone,PartialEq,Default,Serialize,Deserialize)]
pub struct Config {
  #[serde(default)]
  pub global:    GlobalConfig,
  #[serde(default)]
  pub frontends: Vec<FrontendConfig>,
  #[serde(default)]
  pub backends:  Vec<BackendGroupConfig>,
}

#[derive(Debug)]
pub enum ConfigError {
  Io(io::Error),
  UnsupportedFormat(String),
  Parse(String),
  Invalid(String),
}

impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      ConfigError::Io(e)                => write!(f, "could not read configuration file: {}", e),
      ConfigError::UnsupportedFormat(p) => write!(f, "unsupported configuration format: {}", p),
      ConfigError::Parse(e)             => write!(f, "could not parse configuration: {}", e),
      ConfigError::Invalid(e)           => write!(f, "invalid configuration: {}", e),
    }
  }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
  fn from(e: io::Error) -> ConfigError {
    ConfigError::Io(e)
  }
}

impl Config {
  pub fn load_from_path(path: &str) -> Result<Config, ConfigError> {
    let data = fs::read_to_string(path)?;
    let config: Config = if path.ends_with(".toml") {
      toml::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))?
    } else if path.ends_with(".yaml") || path.ends_with(".yml") {
      serde_yaml::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))?
    } else {
      return Err(ConfigError::UnsupportedFormat(path.to_string()));
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let mut frontend_names = Vec::new();
    for frontend in &self.frontends {
      if frontend_names.contains(&&frontend.name) {
        return Err(ConfigError::Invalid(format!("duplicate frontend name: {}", frontend.name)));
      }
      frontend_names.push(&frontend.name);

      if frontend.net == Network::Udp {
        return Err(ConfigError::Invalid(format!("frontend {}: udp frontends are not supported", frontend.name)));
      }

      frontend.address.parse::<SocketAddr>().map_err(|_| {
        ConfigError::Invalid(format!("frontend {}: invalid address {}", frontend.name, frontend.address))
      })?;

      if !self.backends.iter().any(|group| group.name == frontend.backend_group) {
        return Err(ConfigError::Invalid(format!("frontend {}: unknown backend group {}",
          frontend.name, frontend.backend_group)));
      }

      // a partial TLS configuration is a misconfiguration, not plain TCP
      let tls_fields = [&frontend.tls_ca_cert_path, &frontend.tls_cert_path, &frontend.tls_pk_path];
      let given = tls_fields.iter().filter(|field| field.is_some()).count();
      if given != 0 && given != tls_fields.len() {
        return Err(ConfigError::Invalid(format!("frontend {}: incomplete TLS configuration", frontend.name)));
      }

      let ocsp_enabled = frontend.ocsp_staple_enabled || frontend.ocsp_validation_enabled;
      if ocsp_enabled && frontend.ocsp_responder_url.is_none() {
        return Err(ConfigError::Invalid(format!("frontend {}: OCSP enabled without a responder url", frontend.name)));
      }
    }

    let mut group_names = Vec::new();
    for group in &self.backends {
      if group_names.contains(&&group.name) {
        return Err(ConfigError::Invalid(format!("duplicate backend group name: {}", group.name)));
      }
      group_names.push(&group.name);

      if group.servers.is_empty() {
        return Err(ConfigError::Invalid(format!("backend group {} has no servers", group.name)));
      }

      if let Some(strategy) = &group.strategy {
        match strategy.as_str() {
          "single" | "round-robin" | "jump-hash" | "least-connections" => {},
          other => {
            return Err(ConfigError::Invalid(format!("backend group {}: unknown strategy {}", group.name, other)));
          }
        }
      }

      for server in &group.servers {
        server.address.parse::<SocketAddr>().map_err(|_| {
          ConfigError::Invalid(format!("backend {}: invalid address {}", server.name, server.address))
        })?;
      }
    }

    Ok(())
  }
}
