//! latchkey common library
//!
//! Building blocks shared by the latchkey client session and its echo peer:
//!
//! - Credential locations and endpoint defaults
//! - TLS client context with mutual authentication and a chain depth limit
//! - Transport connector (TCP dial plus handshake with deadlines)
//! - Secure channel wrapper with a separate blocking read half
//! - Message framing and the error taxonomy
//!
//! # Features
//!
//! - **Mutual TLS**: the client always presents its certificate and verifies
//!   the peer against a private trust anchor
//! - **Cross-thread shutdown**: [`SocketHandle`] lets any thread abort a
//!   blocked connect, handshake or read
//! - **Line framing**: messages survive TLS record and TCP segment boundaries

/// Credential paths and connection defaults
pub mod config;

/// TCP dial and TLS handshake
pub mod connector;

/// Error taxonomy
pub mod error;

/// Message boundaries
pub mod framing;

/// Peer certificate summary for diagnostics
pub mod peer;

/// Idempotent cross-thread socket close
pub mod socket_handle;

/// TLS client context builder
pub mod tls_context;

/// Secure channel over a TCP socket
pub mod tls_stream;

// Re-export commonly used types for convenience
pub use config::{CredentialPaths, ServerCredentialPaths, DEFAULT_ADDRESS, DEFAULT_PORT};
pub use connector::{connect, Deadlines, Endpoint};
pub use error::{ConfigError, ConnectError, ErrorKind, RuntimeError};
pub use framing::{FrameDecoder, Framing};
pub use peer::PeerIdentity;
pub use socket_handle::SocketHandle;
pub use tls_context::{ensure_crypto_provider, TlsContext, DEFAULT_MAX_CHAIN_DEPTH};
pub use tls_stream::{ChannelReader, SecureChannel};
