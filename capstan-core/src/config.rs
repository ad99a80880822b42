//! Server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`SocketServer`](crate::SocketServer).
///
/// Timeouts are expressed in seconds with the recognized sign conventions:
///
/// - `> 0`: the deadline is armed for that many seconds.
/// - `== 0`: for the idle timeout, no keep-alive at all; the connection is
///   shut down as soon as it is released. For the request timeout: in-flight
///   work is unbounded.
/// - `< 0`: the deadline is disabled; the connection may stay in that state
///   forever.
///
/// A negative `max_connections` means unbounded.
///
/// ## Example
///
/// ```rust
/// use capstan_core::ServerConfig;
///
/// let config = ServerConfig::new()
///     .max_connections(1024)
///     .idle_timeout(30.0)
///     .request_timeout(5.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Connection ceiling; negative means unbounded.
    pub max_connections: i64,
    /// Seconds a connection may stay idle between requests.
    pub idle_timeout: f64,
    /// Seconds a reserved connection may stay busy; `<= 0` disables it.
    pub request_timeout: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: -1,
            idle_timeout: 30.0,
            request_timeout: 0.0,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection ceiling; negative means unbounded.
    pub fn max_connections(mut self, max: i64) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the idle timeout in seconds.
    pub fn idle_timeout(mut self, seconds: f64) -> Self {
        self.idle_timeout = seconds;
        self
    }

    /// Sets the request timeout in seconds.
    pub fn request_timeout(mut self, seconds: f64) -> Self {
        self.request_timeout = seconds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, -1);
        assert_eq!(config.idle_timeout, 30.0);
        assert_eq!(config.request_timeout, 0.0);
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new()
            .max_connections(3)
            .idle_timeout(0.1)
            .request_timeout(0.2);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.idle_timeout, 0.1);
        assert_eq!(config.request_timeout, 0.2);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = ServerConfig::new().max_connections(10).idle_timeout(5.0);
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
