//! Session owner: connects, runs the send loop and tears everything down.
//!
//! Two threads serve a live session. The owner thread builds the TLS context,
//! connects, then waits on a condvar for outbound text or a disconnect
//! request. The receive loop (see `receiver`) reads until the channel ends.
//! Callers on any thread interact through [`Session`].

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use latchkey_common::{
    connector,
    error::{ErrorKind, RuntimeError},
    framing::Framing,
    socket_handle::SocketHandle,
    tls_context::TlsContext,
    tls_stream::SecureChannel,
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{config::SessionConfig, event::SessionEvent, receiver};

/// Lifecycle of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl SessionState {
    /// An owner thread is alive and will report `Disconnected` itself
    fn has_owner(self) -> bool {
        matches!(
            self,
            SessionState::Handshaking | SessionState::Connected | SessionState::Disconnecting
        )
    }

    /// The attempt is over and the session can be reset
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

/// Misuse of the session API
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session already started (state {0:?})")]
    AlreadyStarted(SessionState),

    #[error("session has not finished (state {0:?})")]
    NotFinished(SessionState),

    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("session thread panicked")]
    OwnerPanicked,
}

/// Everything the owner, the receive loop and callers coordinate on. Only
/// touched under `Shared::mailbox`.
struct Mailbox {
    state:                SessionState,
    /// Single slot: a newer message replaces an unsent one
    outbound:             Option<String>,
    disconnect_requested: bool,
    /// Cleared by whichever side ends the session first
    running:              bool,
}

impl Mailbox {
    fn idle() -> Self {
        Self {
            state:                SessionState::Idle,
            outbound:             None,
            disconnect_requested: false,
            running:              false,
        }
    }
}

pub(crate) struct Shared {
    mailbox: Mutex<Mailbox>,
    wake:    Condvar,
    socket:  SocketHandle,
    events:  Sender<SessionEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        trace!("Event: {:?}", event);
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Clears `running`; true if this call is the one that ended the session
    pub(crate) fn clear_running(&self) -> bool {
        std::mem::replace(&mut self.lock().running, false)
    }

    pub(crate) fn wake_owner(&self) {
        self.wake.notify_all();
    }

    fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// Blocks until there is something for the send loop to act on
    fn wait_for_work<'a>(&self, mailbox: MutexGuard<'a, Mailbox>) -> MutexGuard<'a, Mailbox> {
        self.wake
            .wait_while(mailbox, |m| {
                !m.disconnect_requested && m.running && m.outbound.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports a failed attempt. Partial resources are already gone.
    fn fail(&self, kind: ErrorKind, message: String) {
        self.socket.close();
        let disconnect_requested = {
            let mut mailbox = self.lock();
            mailbox.state = SessionState::Failed;
            mailbox.running = false;
            mailbox.disconnect_requested
        };
        error!("Connection attempt failed ({}): {}", kind, message);
        self.emit(SessionEvent::ConnectionFailed { kind, message });
        if disconnect_requested {
            self.emit(SessionEvent::Disconnected);
        }
    }
}

/// A mutually authenticated messaging session with one remote peer.
///
/// All methods take `&self`, so a session can be shared (e.g. in an `Arc`)
/// between a UI thread and workers. Events go to the channel given at
/// construction; it should be unbounded.
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
    owner:  Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(config: SessionConfig, events: Sender<SessionEvent>) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                mailbox: Mutex::new(Mailbox::idle()),
                wake: Condvar::new(),
                socket: SocketHandle::new(),
                events,
            }),
            owner: Mutex::new(None),
        }
    }

    /// Creates a session together with an unbounded event channel
    pub fn with_events(config: SessionConfig) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = unbounded();
        (Self::new(config, tx), rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    fn owner_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts connecting on a background thread and returns immediately.
    /// Only valid from `Idle`.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut owner = self.owner_slot();
        {
            let mut mailbox = self.shared.lock();
            if mailbox.state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted(mailbox.state));
            }
            self.shared.socket.rearm();
            mailbox.state = SessionState::Handshaking;
            mailbox.disconnect_requested = false;
            mailbox.running = false;
        }

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name("latchkey-session".into())
            .spawn(move || run_owner(shared, config));

        match spawned {
            Ok(handle) => {
                *owner = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SessionState::Idle);
                Err(SessionError::Spawn(e))
            }
        }
    }

    /// Queues `text` for sending, replacing any message not yet sent.
    ///
    /// With line framing the text is sent as written; embedded newlines make
    /// the peer see several messages.
    pub fn send_message(&self, text: impl Into<String>) {
        let text = text.into();
        let mut mailbox = self.shared.lock();
        if let Some(replaced) = mailbox.outbound.replace(text) {
            debug!("Replaced unsent message ({} bytes)", replaced.len());
        }
        self.shared.wake.notify_all();
    }

    /// Requests termination. Safe from any thread, in any state, any number
    /// of times; never waits for the session threads.
    ///
    /// While an owner thread is alive it reports `Disconnected` once teardown
    /// is complete. Otherwise this call reports it directly.
    pub fn disconnect(&self) {
        let owner_live = {
            let mut mailbox = self.shared.lock();
            match mailbox.state {
                SessionState::Handshaking | SessionState::Connected => {
                    mailbox.disconnect_requested = true;
                    mailbox.running = false;
                    self.shared.wake.notify_all();
                }
                _ => {}
            }

            // Unblocks a handshake or read in progress. Closed under the
            // lock: start() arms the socket of the next attempt under it too.
            let owner_live = mailbox.state.has_owner();
            if owner_live && self.shared.socket.close() {
                info!("Socket closed by disconnect request");
            }
            owner_live
        };

        if owner_live {
            debug!("Disconnect requested; session thread will finish teardown");
        } else {
            self.shared.emit(SessionEvent::Disconnected);
        }
    }

    /// Waits for the session thread of the current attempt to exit
    pub fn join(&self) -> Result<(), SessionError> {
        let handle = self.owner_slot().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| SessionError::OwnerPanicked),
            None => Ok(()),
        }
    }

    /// Returns a finished session to `Idle` so it can be started again
    pub fn reset(&self) -> Result<(), SessionError> {
        let mut owner = self.owner_slot();
        if let Some(handle) = owner.as_ref() {
            if !handle.is_finished() {
                return Err(SessionError::NotFinished(self.state()));
            }
        }
        if let Some(handle) = owner.take() {
            if handle.join().is_err() {
                warn!("Previous session thread panicked");
            }
        }

        let mut mailbox = self.shared.lock();
        match mailbox.state {
            SessionState::Idle | SessionState::Disconnected | SessionState::Failed => {
                *mailbox = Mailbox::idle();
                Ok(())
            }
            state => Err(SessionError::NotFinished(state)),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state().has_owner() {
            self.disconnect();
        }
        if let Err(e) = self.join() {
            warn!("Session shutdown: {}", e);
        }
    }
}

fn run_owner(shared: Arc<Shared>, config: SessionConfig) {
    let tls = match TlsContext::build(&config.credentials, config.max_chain_depth) {
        Ok(tls) => tls,
        Err(err) => return shared.fail(err.kind(), err.to_string()),
    };

    let connected = connector::connect(&tls, &config.endpoint, &config.deadlines, &shared.socket);
    let mut channel = match connected {
        Ok(channel) => channel,
        Err(err) => {
            drop(tls);
            return shared.fail(err.kind(), err.to_string());
        }
    };

    let cancelled = {
        let mut mailbox = shared.lock();
        if !mailbox.disconnect_requested {
            mailbox.state = SessionState::Connected;
            mailbox.running = true;
        }
        mailbox.disconnect_requested
    };
    if cancelled {
        info!("Disconnect requested during handshake, dropping new channel");
        return teardown(&shared, channel, None, tls);
    }

    shared.emit(SessionEvent::ConnectionSuccessful);
    match channel.peer_identity() {
        Some(peer) => info!("Peer certificate: {}", peer),
        None => warn!("Peer certificate could not be summarised"),
    }

    let spawned = channel
        .reader()
        .and_then(|reader| receiver::spawn(Arc::clone(&shared), reader, config.framing));
    let receiver = match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            let err = RuntimeError::Unknown(format!("unable to start receive loop: {e}"));
            error!("{}", err);
            shared.clear_running();
            shared.emit(SessionEvent::ConnectionFailed {
                kind:    err.kind(),
                message: err.to_string(),
            });
            None
        }
    };

    if receiver.is_some() {
        send_loop(&shared, &mut channel, &config.framing);
    }
    teardown(&shared, channel, receiver, tls);
}

fn send_loop(shared: &Shared, channel: &mut SecureChannel, framing: &Framing) {
    let mut mailbox = shared.lock();
    loop {
        mailbox = shared.wait_for_work(mailbox);

        // A pending disconnect beats a pending message
        if mailbox.disconnect_requested {
            mailbox.running = false;
            if let Some(unsent) = mailbox.outbound.take() {
                debug!("Dropping unsent message ({} bytes)", unsent.len());
            }
            return;
        }
        if !mailbox.running {
            debug!("Receive loop ended, leaving send loop");
            return;
        }
        let Some(text) = mailbox.outbound.take() else {
            continue;
        };
        drop(mailbox);

        // MessageSent goes out before any reply can be decrypted
        let sent = channel.send_and_then(&framing.encode(&text), || {
            trace!("Sent {} bytes", text.len());
            shared.emit(SessionEvent::MessageSent(text));
        });
        if let Err(e) = sent {
            let err = RuntimeError::ChannelBroken(e);
            error!("Failed to send message: {}", err);
            if shared.clear_running() {
                shared.emit(SessionEvent::ServerGoneDown);
            }
            return;
        }

        mailbox = shared.lock();
    }
}

/// Releases channel, socket and TLS context, in that order, once the
/// receive loop has exited.
fn teardown(
    shared: &Shared,
    mut channel: SecureChannel,
    receiver: Option<JoinHandle<()>>,
    tls: TlsContext,
) {
    {
        let mut mailbox = shared.lock();
        mailbox.state = SessionState::Disconnecting;
        mailbox.running = false;
    }

    channel.close_notify();
    channel.interrupt_reads();
    if let Some(handle) = receiver {
        if handle.join().is_err() {
            error!("Receive loop panicked");
        }
    }

    drop(channel);
    if shared.socket.close() {
        debug!("Socket closed");
    }
    drop(tls);

    shared.set_state(SessionState::Disconnected);
    info!("Session disconnected");
    shared.emit(SessionEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use latchkey_common::config::{CredentialPaths, ServerCredentialPaths};
    use latchkey_server::EchoServer;

    use super::*;

    fn unusable_config() -> SessionConfig {
        SessionConfig::new().with_credentials(CredentialPaths::in_dir("/nonexistent/latchkey"))
    }

    fn fixtures() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../common/tests/fixtures")
    }

    /// Echo server on a free port, serving until the flag is cleared
    fn echo_server() -> (u16, Arc<AtomicBool>) {
        let server = EchoServer::bind(&ServerCredentialPaths::in_dir(fixtures()), "127.0.0.1:0")
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        thread::spawn(move || server.run_with_shutdown(flag));
        (port, running)
    }

    #[test]
    fn test_failed_write_reports_server_gone_down_then_disconnected() {
        let (port, running) = echo_server();
        let config = SessionConfig::new()
            .with_credentials(CredentialPaths::in_dir(fixtures()))
            .with_address("127.0.0.1", port)
            .with_server_name("localhost");
        let (session, events) = Session::with_events(config.clone());

        let tls = TlsContext::build(&config.credentials, config.max_chain_depth).unwrap();
        let mut channel =
            connector::connect(&tls, &config.endpoint, &config.deadlines, &session.shared.socket)
                .unwrap();
        {
            let mut mailbox = session.shared.lock();
            mailbox.state = SessionState::Connected;
            mailbox.running = true;
            mailbox.outbound = Some("x".into());
        }

        // Shut in both directions, so the next write fails with EPIPE
        assert!(session.shared.socket.close());
        send_loop(&session.shared, &mut channel, &config.framing);
        teardown(&session.shared, channel, None, tls);

        assert_eq!(events.try_recv(), Ok(SessionEvent::MessageSent("x".into())));
        assert_eq!(events.try_recv(), Ok(SessionEvent::ServerGoneDown));
        assert_eq!(events.try_recv(), Ok(SessionEvent::Disconnected));
        assert!(events.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Disconnected);

        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_disconnect_on_idle_leaves_socket_handle_armed() {
        let (session, events) = Session::with_events(unusable_config());
        session.disconnect();

        // A start() racing this call must still be able to attach its socket
        assert!(!session.shared.socket.is_closed());
        assert_eq!(events.try_recv(), Ok(SessionEvent::Disconnected));
    }

    #[test]
    fn test_mailbox_keeps_only_latest_message() {
        let (session, _events) = Session::with_events(unusable_config());
        session.send_message("A");
        session.send_message("B");
        assert_eq!(session.shared.lock().outbound.as_deref(), Some("B"));
    }

    #[test]
    fn test_disconnect_on_idle_reports_disconnected() {
        let (session, events) = Session::with_events(unusable_config());
        session.disconnect();
        session.disconnect();

        assert_eq!(events.try_recv(), Ok(SessionEvent::Disconnected));
        assert_eq!(events.try_recv(), Ok(SessionEvent::Disconnected));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_bad_credentials_fail_without_unknown_kind() {
        let (session, events) = Session::with_events(unusable_config());
        session.start().unwrap();
        session.join().unwrap();

        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            SessionEvent::ConnectionFailed { kind, .. } => {
                assert_eq!(kind, ErrorKind::SslConnectionFailed)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (session, _events) = Session::with_events(unusable_config());
        session.start().unwrap();
        session.join().unwrap();

        let err = session.start().unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarted(SessionState::Failed)));
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let (session, _events) = Session::with_events(unusable_config());
        session.start().unwrap();
        session.join().unwrap();

        session.reset().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        session.start().unwrap();
        session.join().unwrap();
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Connected.has_owner());
        assert!(!SessionState::Failed.has_owner());
        assert!(SessionState::Disconnected.is_finished());
        assert!(!SessionState::Handshaking.is_finished());
    }
}
