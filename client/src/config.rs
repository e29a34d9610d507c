use std::time::Duration;

use latchkey_common::{
    config::CredentialPaths,
    connector::{Deadlines, Endpoint},
    framing::Framing,
    tls_context::DEFAULT_MAX_CHAIN_DEPTH,
};

/// Configuration for a [`Session`](crate::Session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Client certificate, key and CA bundle
    pub credentials:     CredentialPaths,
    /// Where to connect
    pub endpoint:        Endpoint,
    /// Connect and handshake deadlines
    pub deadlines:       Deadlines,
    /// Message boundaries on the wire
    pub framing:         Framing,
    /// Issuers allowed above the peer certificate
    pub max_chain_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials:     CredentialPaths::new(),
            endpoint:        Endpoint::default(),
            deadlines:       Deadlines::default(),
            framing:         Framing::default(),
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
        }
    }
}

impl SessionConfig {
    /// Creates a session configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the credential paths
    pub fn with_credentials(mut self, credentials: CredentialPaths) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the remote address and port
    pub fn with_address<S: Into<String>>(mut self, address: S, port: u16) -> Self {
        self.endpoint.address = address.into();
        self.endpoint.port = port;
        self
    }

    /// Set the name the peer certificate must match
    pub fn with_server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.endpoint.server_name = server_name.into();
        self
    }

    /// Set the TCP connect deadline
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadlines.connect = timeout;
        self
    }

    /// Set the TLS handshake deadline
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadlines.handshake = timeout;
        self
    }

    /// Set the message framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set the maximum verification chain depth
    pub fn with_max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new();
        assert_eq!(config.endpoint.to_string(), "127.0.0.1:4443");
        assert_eq!(config.endpoint.server_name, "localhost");
        assert_eq!(config.max_chain_depth, 1);
        assert_eq!(config.framing, Framing::default());
        assert_eq!(config.deadlines.handshake, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_builder() {
        let config = SessionConfig::new()
            .with_address("192.0.2.10", 9000)
            .with_server_name("chat.example")
            .with_handshake_timeout(None)
            .with_framing(Framing::raw())
            .with_max_chain_depth(2);

        assert_eq!(config.endpoint.to_string(), "192.0.2.10:9000");
        assert_eq!(config.endpoint.server_name, "chat.example");
        assert_eq!(config.deadlines.handshake, None);
        assert_eq!(config.framing, Framing::Raw { chunk: 256 });
        assert_eq!(config.max_chain_depth, 2);
    }
}
