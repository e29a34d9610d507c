use latchkey_common::error::ErrorKind;

/// Notifications a [`Session`](crate::Session) sends to its caller.
///
/// Events are sent from the session's own threads; a UI must hop to its own
/// thread before touching widgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake finished and the peer was verified
    ConnectionSuccessful,
    /// The attempt ended before a channel was established
    ConnectionFailed {
        kind:    ErrorKind,
        message: String,
    },
    /// One complete inbound message
    MessageReceived(String),
    /// One outbound message was encrypted and handed to the channel. A
    /// socket write failing afterwards is reported as `ServerGoneDown`.
    MessageSent(String),
    /// The peer closed the channel or it broke
    ServerGoneDown,
    /// Session resources are released
    Disconnected,
}

impl SessionEvent {
    /// Events after which the session no longer carries traffic
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::ConnectionFailed { .. }
                | SessionEvent::ServerGoneDown
                | SessionEvent::Disconnected
        )
    }
}
