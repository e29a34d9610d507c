use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use latchkey_client::{CredentialPaths, Session, SessionConfig, SessionEvent};
use latchkey_common::config::ServerCredentialPaths;
use latchkey_server::EchoServer;

/// Runs an echo peer in-process and sends it one message
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== latchkey Basic Example ===");

    let certs = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../common/tests/fixtures");
    let server = EchoServer::bind(&ServerCredentialPaths::in_dir(&certs), "127.0.0.1:0")
        .context("Failed to start echo server")?;
    let port = server.local_addr()?.port();

    let running = Arc::new(AtomicBool::new(true));
    let server_handle = {
        let running = running.clone();
        thread::spawn(move || server.run_with_shutdown(running))
    };

    let config = SessionConfig::new()
        .with_credentials(CredentialPaths::in_dir(&certs))
        .with_address("127.0.0.1", port)
        .with_handshake_timeout(Some(Duration::from_secs(5)));
    let (session, events) = Session::with_events(config);

    println!("Connecting to 127.0.0.1:{}...", port);
    session.start()?;

    while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
        println!("{:?}", event);
        match event {
            SessionEvent::ConnectionSuccessful => session.send_message("hello over mTLS"),
            SessionEvent::MessageReceived(_) => session.disconnect(),
            event if event.is_terminal() => break,
            _ => {}
        }
    }

    session.join()?;
    running.store(false, Ordering::SeqCst);
    server_handle
        .join()
        .map_err(|_| anyhow::anyhow!("Server thread panicked"))??;

    println!("✓ Example completed");
    Ok(())
}
