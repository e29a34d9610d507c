//! Opens the TCP socket and runs the TLS handshake.

use std::{
    fmt, io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use rustls::{pki_types::ServerName, ClientConnection};
use tracing::{debug, info, warn};

use crate::{
    config::{DEFAULT_ADDRESS, DEFAULT_PORT, DEFAULT_SERVER_NAME},
    error::ConnectError,
    socket_handle::SocketHandle,
    tls_context::TlsContext,
    tls_stream::{complete_handshake, SecureChannel},
};

/// Remote endpoint and the name its certificate must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address:     String,
    pub port:        u16,
    /// DNS name or IP literal checked against the peer certificate
    pub server_name: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Deadlines for the blocking phases of a connection attempt. `None` waits
/// forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub connect:   Option<Duration>,
    pub handshake: Option<Duration>,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            connect:   Some(Duration::from_secs(10)),
            handshake: Some(Duration::from_secs(10)),
        }
    }
}

/// Dials `endpoint` and completes a mutually authenticated handshake.
///
/// The socket is registered with `handle` before the handshake starts, so a
/// concurrent [`SocketHandle::close`] aborts it. On any error the socket is
/// closed before returning.
pub fn connect(
    tls: &TlsContext,
    endpoint: &Endpoint,
    deadlines: &Deadlines,
    handle: &SocketHandle,
) -> Result<SecureChannel, ConnectError> {
    let target = endpoint.to_string();
    let handshake_err = |source: io::Error| ConnectError::Handshake {
        endpoint: target.clone(),
        source,
    };

    let server_name = ServerName::try_from(endpoint.server_name.clone()).map_err(|e| {
        handshake_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid server name {:?}: {}", endpoint.server_name, e),
        ))
    })?;

    let addrs: Vec<SocketAddr> = (endpoint.address.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::SocketCreation {
            endpoint: target.clone(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectError::SocketCreation {
            endpoint: target,
            source:   io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved"),
        });
    }

    info!("Connecting to {}", target);
    let mut socket = dial(&addrs, deadlines.connect).map_err(|source| {
        warn!("Unable to connect to {}: {}", target, source);
        ConnectError::Connection {
            endpoint: target.clone(),
            source,
        }
    })?;

    if let Err(source) = handle.attach(&socket) {
        return Err(ConnectError::Connection {
            endpoint: target,
            source,
        });
    }

    debug!("Socket connected, establishing TLS...");
    let handshake = (|| {
        let _ = socket.set_nodelay(true);
        socket.set_read_timeout(deadlines.handshake)?;
        socket.set_write_timeout(deadlines.handshake)?;

        let mut conn = ClientConnection::new(tls.config(), server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        complete_handshake(&mut conn, &mut socket)?;

        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;
        SecureChannel::from_client(socket.try_clone()?, conn)
    })();

    match handshake {
        Ok(channel) => {
            info!(
                "Secure channel established with {} ({})",
                target,
                channel.peer_addr()
            );
            Ok(channel)
        }
        Err(source) => {
            handle.close();
            drop(socket);
            warn!("TLS handshake with {} failed: {}", target, source);
            Err(handshake_err(source))
        }
    }
}

fn dial(addrs: &[SocketAddr], timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to dial")))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::config::CredentialPaths;

    fn context() -> TlsContext {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        TlsContext::build(&CredentialPaths::in_dir(dir), 1).unwrap()
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new("10.0.0.7", 4443).with_server_name("chat.internal");
        assert_eq!(endpoint.to_string(), "10.0.0.7:4443");
        assert_eq!(endpoint.server_name, "chat.internal");
        assert_eq!(Endpoint::default().to_string(), "127.0.0.1:4443");
    }

    #[test]
    fn test_unreachable_peer_is_connection_failed() {
        let endpoint = Endpoint::new("127.0.0.1", closed_port());
        let handle = SocketHandle::new();
        let err = connect(&context(), &endpoint, &Deadlines::default(), &handle).unwrap_err();
        assert!(matches!(err, ConnectError::Connection { .. }), "{err}");
    }

    #[test]
    fn test_unresolvable_host_is_socket_creation() {
        let endpoint = Endpoint::new("host.invalid", 4443);
        let handle = SocketHandle::new();
        let err = connect(&context(), &endpoint, &Deadlines::default(), &handle).unwrap_err();
        assert!(matches!(err, ConnectError::SocketCreation { .. }), "{err}");
    }

    #[test]
    fn test_invalid_server_name_is_handshake_failure() {
        let endpoint = Endpoint::new("127.0.0.1", closed_port()).with_server_name("not a name!");
        let handle = SocketHandle::new();
        let err = connect(&context(), &endpoint, &Deadlines::default(), &handle).unwrap_err();
        assert!(matches!(err, ConnectError::Handshake { .. }), "{err}");
    }

    #[test]
    fn test_silent_peer_hits_handshake_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let deadlines = Deadlines {
            connect:   Some(Duration::from_secs(2)),
            handshake: Some(Duration::from_millis(200)),
        };
        let handle = SocketHandle::new();

        let err = connect(&context(), &endpoint, &deadlines, &handle).unwrap_err();
        assert!(matches!(err, ConnectError::Handshake { .. }), "{err}");
        assert!(handle.is_closed());
    }

    #[test]
    fn test_closed_handle_aborts_before_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let handle = SocketHandle::new();
        handle.close();

        let err = connect(&context(), &endpoint, &Deadlines::default(), &handle).unwrap_err();
        assert!(matches!(err, ConnectError::Connection { .. }), "{err}");
    }
}
