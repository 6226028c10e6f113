//! Centralized configuration for LIP.
//!
//! Protocol constants live on [`ProtocolConfig`]. Runtime settings for a
//! server or a client are plain structs with builder-style setters.

use std::path::PathBuf;
use std::time::Duration;

/// Wire and naming constants shared by servers and clients.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const ENDPOINT_PREFIX: &'static str = "lipcm";
    pub const ENDPOINT_SUFFIX: &'static str = "sock";
    /// Environment variable overriding the namespace directory.
    pub const NAMESPACE_ENV: &'static str = "LIP_NAMESPACE_DIR";
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// `sun_path` is 104 bytes on macOS and 108 on Linux; use the smaller.
    pub const MAX_SOCKET_PATH_LEN: usize = 104;
    pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
    /// How long aborted requests get to flush their `Terminated` response.
    pub const ABORT_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);
}

/// Directory scanned for endpoints when none is configured explicitly.
///
/// `LIP_NAMESPACE_DIR` wins when set and non-empty, otherwise the system
/// temporary directory is used.
pub fn default_namespace_dir() -> PathBuf {
    match std::env::var_os(ProtocolConfig::NAMESPACE_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}

/// Settings for a single function server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory the endpoint is created in.
    pub namespace_dir: PathBuf,
    /// Connections beyond this many are closed on accept.
    pub max_connections: usize,
    /// Time in-flight requests get to finish during `terminate()`.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    pub fn with_namespace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.namespace_dir = dir.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            namespace_dir: default_namespace_dir(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            shutdown_grace: Self::DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Settings for a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory scanned by discovery.
    pub namespace_dir: PathBuf,
    pub connect_timeout: Duration,
    /// Upper bound for one request/response round trip; `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl ClientConfig {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn with_namespace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.namespace_dir = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace_dir: default_namespace_dir(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ServerConfig::DEFAULT_SHUTDOWN_GRACE > ProtocolConfig::ABORT_FLUSH_TIMEOUT);
        assert!(ClientConfig::DEFAULT_CONNECT_TIMEOUT > Duration::ZERO);
        assert!(ProtocolConfig::PROBE_TIMEOUT > Duration::ZERO);
    }

    #[test]
    fn test_builders_override_defaults() {
        let config = ServerConfig::default()
            .with_namespace_dir("/run/lip")
            .with_max_connections(2)
            .with_shutdown_grace(Duration::from_millis(10));

        assert_eq!(config.namespace_dir, PathBuf::from("/run/lip"));
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.shutdown_grace, Duration::from_millis(10));

        let client = ClientConfig::default().with_call_timeout(Some(Duration::from_secs(1)));
        assert_eq!(client.call_timeout, Some(Duration::from_secs(1)));
    }
}
