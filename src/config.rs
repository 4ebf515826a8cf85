//! Start-up configuration and command line.
//!
//! Everything here is fixed once the forwarder starts; there is no runtime
//! reconfiguration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use clap::builder::TypedValueParser;
use clap::Parser;

use crate::backlog::DEFAULT_BACKLOG_SIZE;
use crate::error::ConfigError;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const MAX_CONNECTIONS_LIMIT: usize = 65535;

/// Remote `HOST:PORT` as given by the user; resolved once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn resolve(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| ConfigError::Resolve {
                endpoint: self.to_string(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConfigError::NoAddresses(self.to_string()));
        }
        Ok(addrs)
    }
}

impl FromStr for RemoteEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRemote(s.to_string());

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        // [v6]:port
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }

        let port: u16 = port.parse().map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub remote: RemoteEndpoint,
    pub max_connections: usize,
    /// Backlog capacity per slot and direction, also the relay read size
    pub backlog_size: usize,
    pub connect_timeout: Option<Duration>,
    /// Treat remote connect failures and backlog overflows as fatal
    pub fail_fast: bool,
    pub verbose: bool,
}

impl Config {
    pub fn new(listen: SocketAddr, remote: RemoteEndpoint) -> Self {
        Self {
            listen,
            remote,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backlog_size: DEFAULT_BACKLOG_SIZE,
            connect_timeout: None,
            fail_fast: false,
            verbose: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CONNECTIONS_LIMIT).contains(&self.max_connections) {
            return Err(ConfigError::InvalidCapacity(self.max_connections));
        }
        if self.backlog_size == 0 {
            return Err(ConfigError::InvalidBacklogSize);
        }
        if self.remote.port == 0 {
            return Err(ConfigError::InvalidPort(self.remote.port.to_string()));
        }
        if self.remote.host.is_empty() {
            return Err(ConfigError::InvalidRemote(self.remote.to_string()));
        }
        Ok(())
    }
}

/// Single-threaded TCP port forwarder
#[derive(Parser, Debug)]
#[command(name = "portfwd", version, about, long_about = None)]
pub struct Cli {
    /// Local port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub local_port: u16,

    /// Remote endpoint to forward to, as HOST:PORT
    #[arg(value_name = "REMOTE_HOST:PORT")]
    pub remote: RemoteEndpoint,

    /// Maximum number of simultaneous connections
    #[arg(short, long = "max", value_name = "N", default_value_t = DEFAULT_MAX_CONNECTIONS as u16,
          value_parser = clap::value_parser!(u16).range(1..))]
    pub max_connections: u16,

    /// Log every accept, teardown, relay and backlog flush
    #[arg(short, long)]
    pub verbose: bool,

    /// Local address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Backlog capacity per connection and direction, in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_BACKLOG_SIZE,
          value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    pub backlog_size: usize,

    /// Give up connecting to the remote after this many seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout: Option<u64>,

    /// Exit on remote connect failures and backlog overflows instead of
    /// dropping only the affected connection
    #[arg(long)]
    pub fail_fast: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let config = Config {
            listen: SocketAddr::new(self.bind, self.local_port),
            remote: self.remote,
            max_connections: usize::from(self.max_connections),
            backlog_size: self.backlog_size,
            connect_timeout: self.connect_timeout.map(Duration::from_secs),
            fail_fast: self.fail_fast,
            verbose: self.verbose,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote() {
        let remote: RemoteEndpoint = "example.org:8080".parse().unwrap();
        assert_eq!(remote, RemoteEndpoint::new("example.org", 8080));

        let remote: RemoteEndpoint = "[::1]:22".parse().unwrap();
        assert_eq!(remote, RemoteEndpoint::new("::1", 22));
        assert_eq!(remote.to_string(), "[::1]:22");
    }

    #[test]
    fn test_parse_remote_rejects_garbage() {
        assert!(matches!(
            "no-port".parse::<RemoteEndpoint>(),
            Err(ConfigError::InvalidRemote(_))
        ));
        assert!(matches!(
            ":80".parse::<RemoteEndpoint>(),
            Err(ConfigError::InvalidRemote(_))
        ));
        assert!(matches!(
            "host:0".parse::<RemoteEndpoint>(),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            "host:99999".parse::<RemoteEndpoint>(),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_resolve_ip_literal() {
        let addrs = RemoteEndpoint::new("127.0.0.1", 9000).resolve().unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse().unwrap()]);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["portfwd", "8000", "10.0.0.1:80"]).unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.listen, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.remote, RemoteEndpoint::new("10.0.0.1", 80));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.backlog_size, DEFAULT_BACKLOG_SIZE);
        assert_eq!(config.connect_timeout, None);
        assert!(!config.verbose);
        assert!(!config.fail_fast);
    }

    #[test]
    fn test_cli_options() {
        let cli = Cli::try_parse_from([
            "portfwd",
            "2222",
            "host:22",
            "--max",
            "3",
            "-v",
            "--bind",
            "127.0.0.1",
            "--backlog-size",
            "4096",
            "--connect-timeout",
            "5",
            "--fail-fast",
        ])
        .unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.listen, "127.0.0.1:2222".parse().unwrap());
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.backlog_size, 4096);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
        assert!(config.verbose);
        assert!(config.fail_fast);
    }

    #[test]
    fn test_cli_rejects_silly_values() {
        assert!(Cli::try_parse_from(["portfwd", "0", "host:22"]).is_err());
        assert!(Cli::try_parse_from(["portfwd", "22", "host"]).is_err());
        assert!(Cli::try_parse_from(["portfwd", "22", "host:22", "--max", "0"]).is_err());
        assert!(Cli::try_parse_from(["portfwd", "22", "host:22", "--max", "65536"]).is_err());
        assert!(Cli::try_parse_from(["portfwd", "22", "host:22", "--backlog-size", "0"]).is_err());
        assert!(Cli::try_parse_from(["portfwd", "22"]).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::new(
            "127.0.0.1:0".parse().unwrap(),
            RemoteEndpoint::new("127.0.0.1", 1),
        );
        assert!(config.validate().is_ok());

        config.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCapacity(0))
        ));

        config.max_connections = 1;
        config.backlog_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBacklogSize)
        ));
    }
}
