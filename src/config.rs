// Client and server configuration.
//
// Plain structs with builder-style setters; serde derives let the server
// binary read a JSON config file.

use serde::Deserialize;
use std::time::Duration;

fn default_listen_addr() -> String {
    "127.0.0.1:9206".to_string()
}

fn default_max_connections() -> usize {
    256
}

/// Server-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Accepted connect tokens. Empty means unauthenticated accept.
    #[serde(default)]
    pub tokens: Vec<u64>,

    /// Upper bound on concurrently served sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            tokens: Vec::new(),
            max_connections: default_max_connections(),
        }
    }
}

impl ServerConfig {
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_tokens(mut self, tokens: &[u64]) -> Self {
        self.tokens = tokens.to_vec();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

fn default_reconnect_delay_ms() -> u64 {
    100
}

fn default_reconnect_attempts() -> u32 {
    8
}

fn default_pipe_pool_limit() -> usize {
    16
}

fn default_reconnect() -> bool {
    true
}

/// Client-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub connect_addr: String,

    /// Up to two connect tokens presented in the header slots.
    #[serde(default)]
    pub tokens: Vec<u64>,

    /// Whether restorable handles re-establish after a dropped transport.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,

    /// Delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Attempts before the session is marked closed.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Recycled request pipes kept per session.
    #[serde(default = "default_pipe_pool_limit")]
    pub pipe_pool_limit: usize,
}

impl ClientConfig {
    pub fn new(connect_addr: impl Into<String>) -> Self {
        ClientConfig {
            connect_addr: connect_addr.into(),
            tokens: Vec::new(),
            reconnect: default_reconnect(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_reconnect_attempts(),
            pipe_pool_limit: default_pipe_pool_limit(),
        }
    }

    pub fn with_tokens(mut self, tokens: &[u64]) -> Self {
        self.tokens = tokens.to_vec();
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_from_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"listen_addr":"0.0.0.0:9206","tokens":[1,2]}"#).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9206");
        assert_eq!(config.tokens, vec![1, 2]);
        assert_eq!(config.max_connections, 256);
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("127.0.0.1:9206")
            .with_tokens(&[5])
            .with_reconnect(false)
            .with_reconnect_delay(Duration::from_millis(250));
        assert_eq!(config.tokens, vec![5]);
        assert!(!config.reconnect);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    }
}
