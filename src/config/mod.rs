//! Server configuration and sentinel resolution.
//!
//! Numeric settings use two sentinel values shared by every knob:
//!
//! | Value      | Workers limit           | Buffer size              |
//! |------------|-------------------------|--------------------------|
//! | [`NO`]     | unlimited               | unbuffered               |
//! | [`DEFAULT`]| [`DEFAULT_WORKERS_LIMIT`] | [`DEFAULT_BUFFER_SIZE`] |
//! | `> 0`      | exact cap               | exact size               |
//!
//! Any other negative value is rejected with a [`ConfigError`] before a
//! socket is opened.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Sentinel for "no limit" / "no buffering".
pub const NO: isize = -1;

/// Sentinel for "use the default value".
pub const DEFAULT: isize = 0;

/// Safety cap applied when the workers limit is [`DEFAULT`].
pub const DEFAULT_WORKERS_LIMIT: usize = 1024 * 1024;

/// Buffer size applied when a buffer setting is [`DEFAULT`].
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

pub const DEFAULT_NETWORK: &str = "tcp";
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:3000";

/// Plain settings for a [`Server`](crate::Server).
///
/// Deserializable so it can be loaded from a file; missing fields take
/// their defaults.
///
/// # Examples
///
/// ```
/// use tcpkit::config::{ServerConfig, NO};
///
/// let config: ServerConfig =
///     serde_json::from_str(r#"{ "addr": "127.0.0.1:0", "read_buffer_size": -1 }"#).unwrap();
/// assert_eq!(config.network, "tcp");
/// assert_eq!(config.read_buffer_size, NO);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `"tcp"`, `"tcp4"` or `"tcp6"`. Empty means `"tcp"`.
    pub network: String,
    /// Bind address. Empty means `"0.0.0.0:3000"`.
    pub addr: String,
    /// Maximum number of simultaneously live connections.
    pub workers_limit: isize,
    /// Per-connection read buffer size.
    pub read_buffer_size: isize,
    /// Per-connection write buffer size.
    pub write_buffer_size: isize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_owned(),
            addr: DEFAULT_ADDRESS.to_owned(),
            workers_limit: DEFAULT,
            read_buffer_size: DEFAULT,
            write_buffer_size: DEFAULT,
        }
    }
}

impl ServerConfig {
    /// Config bound to `addr` with every other field defaulted.
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Validates the numeric settings and network kind.
    ///
    /// Performs no I/O; the address itself is only checked when binding.
    pub fn resolve(&self) -> Result<Resolved, ConfigError> {
        let limit = ConnLimit::from_setting(self.workers_limit)?;
        let read_buffer = BufferSize::from_setting(self.read_buffer_size)
            .ok_or(ConfigError::NegativeReadBuffer(self.read_buffer_size))?;
        let write_buffer = BufferSize::from_setting(self.write_buffer_size)
            .ok_or(ConfigError::NegativeWriteBuffer(self.write_buffer_size))?;
        let network = if self.network.is_empty() {
            Network::Tcp
        } else {
            self.network.parse()?
        };
        let addr = if self.addr.is_empty() {
            DEFAULT_ADDRESS.to_owned()
        } else {
            self.addr.clone()
        };

        Ok(Resolved {
            network,
            addr,
            limit,
            read_buffer,
            write_buffer,
        })
    }
}

/// A validated [`ServerConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub network: Network,
    pub addr: String,
    pub limit: ConnLimit,
    pub read_buffer: BufferSize,
    pub write_buffer: BufferSize,
}

/// Concurrent-connection cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnLimit {
    Unlimited,
    Max(usize),
}

impl ConnLimit {
    /// Maps a raw setting onto a limit, rejecting values below [`NO`].
    pub fn from_setting(value: isize) -> Result<Self, ConfigError> {
        match value {
            NO => Ok(Self::Unlimited),
            DEFAULT => Ok(Self::Max(DEFAULT_WORKERS_LIMIT)),
            n if n > 0 => Ok(Self::Max(n as usize)),
            n => Err(ConfigError::NegativeWorkersLimit(n)),
        }
    }
}

/// Per-direction buffering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    Unbuffered,
    Size(usize),
}

impl BufferSize {
    /// Maps a raw setting onto a buffer mode; `None` for values below [`NO`].
    pub fn from_setting(value: isize) -> Option<Self> {
        match value {
            NO => Some(Self::Unbuffered),
            DEFAULT => Some(Self::Size(DEFAULT_BUFFER_SIZE)),
            n if n > 0 => Some(Self::Size(n as usize)),
            _ => None,
        }
    }

    pub fn capacity(self) -> Option<usize> {
        match self {
            Self::Unbuffered => None,
            Self::Size(n) => Some(n),
        }
    }
}

/// Network kind accepted by the listener setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// IPv4 or IPv6.
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        }
    }

    pub fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }

    /// Resolves `addr` and keeps the candidates of this network's family.
    ///
    /// Hostnames are looked up with the blocking system resolver; async
    /// callers should use [`lookup`](Self::lookup).
    pub fn resolve(self, addr: &str) -> Result<Vec<SocketAddr>, ConfigError> {
        let found = addr
            .to_socket_addrs()
            .map_err(|source| invalid_address(addr, source))?;
        self.admit_all(addr, found)
    }

    /// Like [`resolve`](Self::resolve), without blocking the runtime.
    pub async fn lookup(self, addr: &str) -> Result<Vec<SocketAddr>, ConfigError> {
        let found = tokio::net::lookup_host(addr)
            .await
            .map_err(|source| invalid_address(addr, source))?;
        self.admit_all(addr, found)
    }

    fn admit_all(
        self,
        addr: &str,
        found: impl Iterator<Item = SocketAddr>,
    ) -> Result<Vec<SocketAddr>, ConfigError> {
        let candidates: Vec<SocketAddr> = found.filter(|a| self.admits(a)).collect();
        if candidates.is_empty() {
            return Err(ConfigError::NoAddress {
                addr: addr.to_owned(),
                network: self.as_str().to_owned(),
            });
        }
        Ok(candidates)
    }
}

fn invalid_address(addr: &str, source: std::io::Error) -> ConfigError {
    ConfigError::InvalidAddress {
        addr: addr.to_owned(),
        source,
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            other => Err(ConfigError::UnknownNetwork(other.to_owned())),
        }
    }
}
