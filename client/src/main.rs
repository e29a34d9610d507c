use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use latchkey_client::{
    CredentialPaths, Framing, Session, SessionConfig, SessionEvent, SessionState,
};
use latchkey_common::config::{DEFAULT_ADDRESS, DEFAULT_PORT, DEFAULT_SERVER_NAME};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "latchkey")]
#[command(about = "Line messaging over mutually authenticated TLS")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Remote address
    #[arg(short, long, default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Remote port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Name the server certificate must be issued for
    #[arg(long, default_value = DEFAULT_SERVER_NAME)]
    server_name: String,

    /// Directory holding client.pem, client.key.pem and root-ca.pem
    #[arg(long)]
    certs_dir: Option<PathBuf>,

    /// Client certificate (overrides --certs-dir)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key (overrides --certs-dir)
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA bundle (overrides --certs-dir)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Handshake deadline in seconds, 0 waits forever
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// Treat every read as one message instead of splitting lines
    #[arg(long)]
    raw: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut credentials = match &self.certs_dir {
            Some(dir) => CredentialPaths::in_dir(dir),
            None => CredentialPaths::new(),
        };
        if let Some(cert) = &self.cert {
            credentials.cert_path = cert.clone();
        }
        if let Some(key) = &self.key {
            credentials.key_path = key.clone();
        }
        if let Some(ca) = &self.ca {
            credentials.ca_path = ca.clone();
        }

        let handshake_timeout =
            (self.handshake_timeout > 0).then(|| Duration::from_secs(self.handshake_timeout));
        let framing = if self.raw {
            Framing::raw()
        } else {
            Framing::default()
        };

        SessionConfig::new()
            .with_credentials(credentials)
            .with_address(self.address.clone(), self.port)
            .with_server_name(self.server_name.clone())
            .with_handshake_timeout(handshake_timeout)
            .with_framing(framing)
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ConnectionSuccessful => println!("Successfully connected to the server."),
        SessionEvent::ConnectionFailed { kind, message } => {
            println!("{}: {}", kind, message);
            println!("Type /connect to try again.");
        }
        SessionEvent::MessageReceived(text) => println!("Received: {}", text),
        SessionEvent::MessageSent(text) => println!("Sent: {}", text),
        SessionEvent::ServerGoneDown => {
            println!("Server has gone down. Please try again later.")
        }
        SessionEvent::Disconnected => println!("Disconnected from server."),
    }
}

fn reconnect(session: &Session) -> Result<()> {
    if !session.state().is_finished() && session.state() != SessionState::Idle {
        println!("Already connected; /disconnect first.");
        return Ok(());
    }
    session.join().context("Previous session ended abnormally")?;
    session.reset().context("Failed to reset session")?;
    session.start().context("Failed to start session")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = args.session_config();
    info!("Connecting to {} as {:?}", config.endpoint, config.credentials.cert_path);

    let (session, events) = Session::with_events(config);

    // Events arrive on session threads; printing is the only UI here
    let printer = thread::spawn(move || {
        for event in events.iter() {
            print_event(&event);
        }
    });

    session.start().context("Failed to start session")?;

    println!("Type a message and press Enter. Commands: /disconnect, /connect, /quit");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        match line.trim() {
            "" => {}
            "/quit" | "/exit" => break,
            "/disconnect" => session.disconnect(),
            "/connect" => reconnect(&session)?,
            _ => session.send_message(line),
        }
        io::stdout().flush()?;
    }

    if !session.state().is_finished() {
        session.disconnect();
    }
    session.join().context("Session ended abnormally")?;
    // Last sender goes with the session, which ends the printer
    drop(session);
    let _ = printer.join();
    Ok(())
}
