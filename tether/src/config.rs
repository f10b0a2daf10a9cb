//! Runtime configuration.
//!
//! Built directly as a struct (with [`Default`]) or parsed from `key=value`
//! parameters:
//!
//! ```text
//! ipc_application_domain=AF_INET   ipc_servicebrocker_domain=AF_INET
//! ipc_application_type=SOCK_DGRAM  ipc_servicebrocker_type=SOCK_DGRAM
//! ipc_application_protocole=0      ipc_servicebrocker_protocole=0
//! ipc_application_address=0.0.0.0  ipc_servicebrocker_address=127.0.0.1
//! ipc_application_port=5000        ipc_servicebrocker_port=5001
//! ipc_application_buffer_size=4096 ipc_servicebrocker_buffer_size=4096
//! application_wd_timout=10         max_priority=16   process_id=100
//! ```

use std::net::IpAddr;
use std::time::Duration;

use crate::net::Endpoint;
use crate::trace::debug;
use crate::types::ProcessId;

/// Default datagram buffer size for IPC channels.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of inbox lanes.
pub const DEFAULT_MAX_PRIORITY: usize = 16;

/// Default per-thread watchdog timeout.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("unsupported {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketDomain {
    Unix,
    Inet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// One logical IPC channel (socket parameters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub domain: SocketDomain,
    pub socket_type: SocketType,
    pub protocol: i32,
    pub address: String,
    pub port: u16,
    pub buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            domain: SocketDomain::Inet,
            socket_type: SocketType::Datagram,
            protocol: 0,
            address: "127.0.0.1".to_owned(),
            port: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ChannelConfig {
    /// A UDP channel on the given endpoint.
    #[must_use]
    pub fn udp(endpoint: Endpoint) -> Self {
        Self {
            address: endpoint.ip().to_string(),
            port: endpoint.port(),
            ..Self::default()
        }
    }

    /// Resolves the socket endpoint.
    ///
    /// # Errors
    ///
    /// Fails for anything but an IPv4/IPv6 datagram socket, or an address
    /// that does not parse.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        if self.domain != SocketDomain::Inet || self.socket_type != SocketType::Datagram {
            return Err(ConfigError::Unsupported(format!(
                "socket {:?}/{:?}",
                self.domain, self.socket_type
            )));
        }
        let ip: IpAddr = self.address.parse().map_err(|_| ConfigError::InvalidValue {
            key: "address".to_owned(),
            value: self.address.clone(),
        })?;
        Ok(Endpoint::new(ip, self.port))
    }
}

/// IPC transport settings.
#[derive(Debug, Clone, Default)]
pub struct IpcConfig {
    /// Channel this process listens on.
    pub application: ChannelConfig,
    /// Fallback destination for processes with no known endpoint.
    pub broker: Option<ChannelConfig>,
    /// Statically known peers.
    pub peers: Vec<(ProcessId, Endpoint)>,
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// This process's id in contexts and on the wire.
    pub process_id: ProcessId,
    /// Number of inbox lanes per loop.
    pub max_priority: usize,
    /// Default watchdog timeout; zero disables the watchdog thread.
    pub watchdog_timeout: Duration,
    /// Watchdog polling period. `None` means half the timeout.
    pub watchdog_interval: Option<Duration>,
    /// How long `start` waits for every loop to report running.
    pub start_timeout: Duration,
    pub ipc: Option<IpcConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            process_id: ProcessId(std::process::id()),
            max_priority: DEFAULT_MAX_PRIORITY,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            watchdog_interval: None,
            start_timeout: Duration::from_secs(5),
            ipc: None,
        }
    }
}

impl RuntimeConfig {
    /// Parses `key=value` parameters on top of the defaults.
    ///
    /// IPC is enabled when any `ipc_application_*` key is present; a broker
    /// channel when any `ipc_servicebrocker_*` key is present.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed parameters or values.
    pub fn from_params<I, S>(params: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        let mut application: Option<ChannelConfig> = None;
        let mut broker: Option<ChannelConfig> = None;

        for param in params {
            let param = param.as_ref().trim_start_matches('-');
            let Some((key, value)) = param.split_once('=') else {
                return Err(ConfigError::MissingValue(param.to_owned()));
            };
            if let Some(field) = key.strip_prefix("ipc_application_") {
                apply_channel(application.get_or_insert_with(ChannelConfig::default), key, field, value)?;
                continue;
            }
            if let Some(field) = key.strip_prefix("ipc_servicebrocker_") {
                apply_channel(broker.get_or_insert_with(ChannelConfig::default), key, field, value)?;
                continue;
            }
            match key {
                "application_wd_timout" => {
                    config.watchdog_timeout = Duration::from_secs(parse(key, value)?);
                }
                "max_priority" => config.max_priority = parse(key, value)?,
                "process_id" => config.process_id = ProcessId(parse(key, value)?),
                _ => debug!(key, "ignoring unknown parameter"),
            }
        }

        if application.is_some() || broker.is_some() {
            config.ipc = Some(IpcConfig {
                application: application.unwrap_or_default(),
                broker,
                peers: Vec::new(),
            });
        }
        Ok(config)
    }

    /// Effective watchdog polling period.
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_interval
            .unwrap_or(self.watchdog_timeout / 2)
            .max(Duration::from_millis(1))
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn apply_channel(
    channel: &mut ChannelConfig,
    key: &str,
    field: &str,
    value: &str,
) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    };
    match field {
        "domain" => {
            channel.domain = match value {
                "AF_UNIX" | "unix" | "local" => SocketDomain::Unix,
                "AF_INET" | "AF_INET6" | "inet" | "inet6" => SocketDomain::Inet,
                _ => return Err(invalid()),
            };
        }
        "type" => {
            channel.socket_type = match value {
                "SOCK_STREAM" | "stream" => SocketType::Stream,
                "SOCK_DGRAM" | "dgram" | "datagram" => SocketType::Datagram,
                _ => return Err(invalid()),
            };
        }
        "protocole" | "protocol" => channel.protocol = parse(key, value)?,
        "address" => channel.address = value.to_owned(),
        "port" => channel.port = parse(key, value)?,
        "buffer_size" => channel.buffer_size = parse(key, value)?,
        _ => debug!(key, "ignoring unknown channel parameter"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_ipc() {
        let config = RuntimeConfig::default();
        assert!(config.ipc.is_none());
        assert_eq!(config.max_priority, DEFAULT_MAX_PRIORITY);
        assert_eq!(config.watchdog_interval(), Duration::from_secs(5));
    }

    #[test]
    fn parses_channel_and_runtime_keys() {
        let config = RuntimeConfig::from_params([
            "ipc_application_domain=AF_INET",
            "ipc_application_type=SOCK_DGRAM",
            "ipc_application_address=127.0.0.1",
            "ipc_application_port=5000",
            "ipc_application_buffer_size=8192",
            "ipc_servicebrocker_port=5001",
            "application_wd_timout=3",
            "max_priority=4",
            "process_id=77",
            "trace_log=console",
        ])
        .unwrap();

        assert_eq!(config.watchdog_timeout, Duration::from_secs(3));
        assert_eq!(config.max_priority, 4);
        assert_eq!(config.process_id, ProcessId(77));
        let ipc = config.ipc.unwrap();
        assert_eq!(ipc.application.port, 5000);
        assert_eq!(ipc.application.buffer_size, 8192);
        assert_eq!(
            ipc.application.endpoint().unwrap(),
            Endpoint::localhost(5000)
        );
        assert_eq!(ipc.broker.unwrap().port, 5001);
    }

    #[test]
    fn rejects_bad_values() {
        let err = RuntimeConfig::from_params(["ipc_application_port=http"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        let err = RuntimeConfig::from_params(["max_priority"]).unwrap_err();
        assert_eq!(err, ConfigError::MissingValue("max_priority".to_owned()));
    }

    #[test]
    fn stream_channels_are_unsupported() {
        let channel = ChannelConfig {
            socket_type: SocketType::Stream,
            ..ChannelConfig::default()
        };
        assert!(matches!(channel.endpoint(), Err(ConfigError::Unsupported(_))));
    }
}
