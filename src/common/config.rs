//! Server configuration.
//!
//! Configuration is read once at startup from a Java-style properties file.
//! Every key is optional and falls back to the value in [`Config::default`].
//!
//! ```text
//! # rpc program served on both sockets
//! program = 536870912
//! udp = 0.0.0.0:2049
//! tcp = none
//! workers = 8
//! worker-timeout-ms = 1000
//! max-record-size = 1048576
//! max-connections = 200
//! connection-max-age-secs = 360
//! ```
//!
//! `udp` and `tcp` take a socket address or `none` to leave that transport
//! out. Port 0 binds an ephemeral port, which is then what gets registered
//! with the port mapper. `worker-timeout-ms = 0` lets idle workers wait
//! forever. Without `max-connections` the limit on accepted connections
//! scales with the worker count.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read},
    net::SocketAddr,
    path::Path,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

use super::Program;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("malformed properties: {0}")]
    Properties(#[from] java_properties::PropertiesError),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("unexpected key: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub program: Program,
    pub udp: Option<SocketAddr>,
    pub tcp: Option<SocketAddr>,
    pub n_worker: usize,
    /// How long an idle worker waits for a socket before its loop comes
    /// around again. `None` waits until woken.
    pub worker_timeout: Option<Duration>,
    /// Largest TCP record body accepted.
    pub max_record: usize,
    /// Limit on accepted (temporary) connections.
    pub max_connections: Option<usize>,
    /// Accepted connections unused for this long are closed.
    pub connection_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let any = SocketAddr::from(([0, 0, 0, 0], 0));
        Self {
            // first program number of the user-defined range
            program: 0x2000_0000,
            udp: Some(any),
            tcp: Some(any),
            n_worker: 1,
            worker_timeout: Some(Duration::from_millis(1000)),
            max_record: 1 << 20,
            max_connections: None,
            connection_max_age: Duration::from_secs(6 * 60),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        Self::from_properties(java_properties::read(reader)?)
    }

    fn from_properties(properties: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in properties {
            fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            fn address(key: &str, value: &str) -> Result<Option<SocketAddr>, ConfigError> {
                if value.trim() == "none" {
                    Ok(None)
                } else {
                    parse(key, value).map(Some)
                }
            }

            match &*key {
                "program" => config.program = parse(&key, &value)?,
                "udp" => config.udp = address(&key, &value)?,
                "tcp" => config.tcp = address(&key, &value)?,
                "workers" => {
                    config.n_worker = parse(&key, &value)?;
                    if config.n_worker == 0 {
                        return Err(ConfigError::Invalid {
                            key: key.clone(),
                            value,
                        });
                    }
                }
                "worker-timeout-ms" => {
                    config.worker_timeout = match parse(&key, &value)? {
                        0 => None,
                        millis => Some(Duration::from_millis(millis)),
                    }
                }
                "max-record-size" => config.max_record = parse(&key, &value)?,
                "max-connections" => config.max_connections = Some(parse(&key, &value)?),
                "connection-max-age-secs" => {
                    config.connection_max_age = Duration::from_secs(parse(&key, &value)?)
                }
                _ => return Err(ConfigError::Unknown(key.clone())),
            }
        }
        Ok(config)
    }

    /// Number of accepted connections tolerated before the least recently
    /// used one gets closed.
    pub fn connection_limit(&self, n_worker: usize) -> usize {
        self.max_connections.unwrap_or((n_worker + 3) * 20)
    }
}

impl FromStr for Config {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_reader(s.as_bytes())
    }
}
