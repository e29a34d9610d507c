//! latchkey client library
//!
//! A messaging session over mutually authenticated TLS. The session owns two
//! threads: one connects and sends, the other receives. Callers start it,
//! hand it text and ask it to disconnect; everything that happens comes back
//! as [`SessionEvent`]s.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use latchkey_client::{CredentialPaths, Session, SessionConfig, SessionEvent};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = SessionConfig::new()
//!     .with_credentials(CredentialPaths::in_dir("certs"))
//!     .with_address("127.0.0.1", 4443)
//!     .with_handshake_timeout(Some(Duration::from_secs(5)));
//!
//! let (session, events) = Session::with_events(config);
//! session.start()?;
//!
//! if events.recv()? == SessionEvent::ConnectionSuccessful {
//!     session.send_message("hello");
//! }
//! while let Ok(event) = events.recv_timeout(Duration::from_secs(1)) {
//!     println!("{event:?}");
//! }
//!
//! session.disconnect();
//! session.join()?;
//! # Ok(())
//! # }
//! ```

mod config;
mod event;
mod receiver;
mod session;

pub use config::SessionConfig;
pub use event::SessionEvent;
pub use session::{Session, SessionError, SessionState};
// Re-export important types from latchkey-common for convenience
pub use latchkey_common::{CredentialPaths, Endpoint, ErrorKind, Framing};
