#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Receiver;
use latchkey_client::{CredentialPaths, SessionConfig, SessionEvent};
use latchkey_common::config::ServerCredentialPaths;
use latchkey_server::{EchoOptions, EchoServer};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../common/tests/fixtures")
}

/// Echo server running on a background thread until dropped
pub struct Peer {
    pub port: u16,
    running:  Arc<AtomicBool>,
    handle:   Option<JoinHandle<()>>,
}

impl Peer {
    pub fn start(paths: ServerCredentialPaths, options: EchoOptions) -> Self {
        let server = EchoServer::bind(&paths, "127.0.0.1:0")
            .expect("bind echo server")
            .with_options(options);
        let port = server.local_addr().expect("local addr").port();
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = Arc::clone(&running);
            thread::spawn(move || {
                server.run_with_shutdown(running).expect("echo server");
            })
        };

        Self {
            port,
            running,
            handle: Some(handle),
        }
    }

    pub fn echo() -> Self {
        Self::start(ServerCredentialPaths::in_dir(fixtures()), EchoOptions::default())
    }

    pub fn closing_after_first_echo() -> Self {
        Self::start(
            ServerCredentialPaths::in_dir(fixtures()),
            EchoOptions::default().with_close_after_first_echo(true),
        )
    }

    /// Presents `<name>.pem` and `<name>.key.pem` from the fixtures
    pub fn presenting(name: &str) -> Self {
        let dir = fixtures();
        Self::start(
            ServerCredentialPaths::from_files(
                dir.join(format!("{name}.pem")),
                dir.join(format!("{name}.key.pem")),
                dir.join("root-ca.pem"),
            ),
            EchoOptions::default(),
        )
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn client_config(port: u16) -> SessionConfig {
    SessionConfig::new()
        .with_credentials(CredentialPaths::in_dir(fixtures()))
        .with_address("127.0.0.1", port)
        .with_server_name("localhost")
        .with_handshake_timeout(Some(EVENT_TIMEOUT))
}

pub fn next_event(events: &Receiver<SessionEvent>) -> SessionEvent {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for a session event")
}

/// Asserts no further event shows up for a short while
pub fn assert_quiet(events: &Receiver<SessionEvent>) {
    if let Ok(event) = events.recv_timeout(Duration::from_millis(300)) {
        panic!("unexpected extra event {event:?}");
    }
}
