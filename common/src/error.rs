//! Error taxonomy for credential loading, connection setup and the live
//! channel.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Category reported to the caller when a connection attempt fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The socket could not be created (includes address resolution)
    SocketCreationFailed,
    /// The remote endpoint could not be reached
    ConnectionFailed,
    /// TLS setup or handshake failed
    SslConnectionFailed,
    /// Anything that does not fit the categories above
    UnknownError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::SocketCreationFailed => "Socket Creation Failed",
            ErrorKind::ConnectionFailed => "Connection Failed",
            ErrorKind::SslConnectionFailed => "SSL Connection Failed",
            ErrorKind::UnknownError => "Unknown Error",
        };
        f.write_str(label)
    }
}

/// Failure while turning credential files into a TLS client context
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Local certificate or private key could not be loaded
    #[error("failed to load client certificate or key from {path:?}: {reason}")]
    CertificateLoad {
        /// File that failed
        path:   PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Trust anchor bundle could not be loaded
    #[error("failed to load trust anchors from {path:?}: {reason}")]
    TrustAnchorLoad {
        /// File that failed
        path:   PathBuf,
        /// What went wrong
        reason: String,
    },
}

impl ConfigError {
    /// TLS context problems are reported as TLS failures
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SslConnectionFailed
    }
}

/// Failure while opening the socket or running the handshake
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Address resolution or socket creation failed
    #[error("unable to create socket for {endpoint}: {source}")]
    SocketCreation {
        /// `address:port` being dialled
        endpoint: String,
        #[source]
        source:   io::Error,
    },

    /// The peer could not be reached
    #[error("unable to connect to {endpoint}: {source}")]
    Connection {
        /// `address:port` being dialled
        endpoint: String,
        #[source]
        source:   io::Error,
    },

    /// The TLS handshake failed; the socket is already closed
    #[error("TLS handshake with {endpoint} failed: {source}")]
    Handshake {
        /// `address:port` being dialled
        endpoint: String,
        #[source]
        source:   io::Error,
    },
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::SocketCreation { .. } => ErrorKind::SocketCreationFailed,
            ConnectError::Connection { .. } => ErrorKind::ConnectionFailed,
            ConnectError::Handshake { .. } => ErrorKind::SslConnectionFailed,
        }
    }
}

/// Failure on an established channel
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Read or write on the secure channel failed
    #[error("secure channel broken: {0}")]
    ChannelBroken(#[source] io::Error),

    /// Unexpected internal failure (thread spawn, socket clone)
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::UnknownError
    }
}
