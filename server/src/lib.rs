//! latchkey echo peer
//!
//! A mutual-TLS server that echoes every byte it receives back to the
//! client. It exists to exercise the latchkey client end to end: it demands
//! a client certificate issued by its CA and can be told to close the
//! channel right after its first reply.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use latchkey_common::{
    config::ServerCredentialPaths,
    tls_context::{ensure_crypto_provider, load_certificates, load_private_key},
};
use rustls::{server::WebPkiClientVerifier, RootCertStore, ServerConfig, ServerConnection, StreamOwned};

/// Behaviour switches for [`EchoServer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoOptions {
    /// Send close_notify after the first echoed read
    pub close_after_first_echo: bool,
}

impl EchoOptions {
    pub fn with_close_after_first_echo(mut self, close: bool) -> Self {
        self.close_after_first_echo = close;
        self
    }
}

/// Mutual-TLS echo server bound to a TCP address
pub struct EchoServer {
    tls_config: Arc<ServerConfig>,
    listener:   TcpListener,
    options:    EchoOptions,
}

impl EchoServer {
    /// Loads the server credentials and binds `addr`.
    ///
    /// # Arguments
    /// * `paths` - Server certificate chain, key, and the CA that issues
    ///   client certificates
    /// * `addr` - Address to listen on; port 0 picks a free port
    pub fn bind<A: ToSocketAddrs>(paths: &ServerCredentialPaths, addr: A) -> Result<Self> {
        ensure_crypto_provider();

        tracing::info!("Creating echo server with certificates:");
        tracing::info!("  - Server cert: {:?}", paths.cert_path);
        tracing::info!("  - Server key: {:?}", paths.key_path);
        tracing::info!("  - CA cert: {:?}", paths.ca_path);

        let cert_chain = load_certificates(&paths.cert_path)
            .with_context(|| format!("Failed to read certificate from {:?}", paths.cert_path))?;
        let private_key = load_private_key(&paths.key_path)
            .with_context(|| format!("Failed to read private key from {:?}", paths.key_path))?;
        let ca_certs = load_certificates(&paths.ca_path)
            .with_context(|| format!("Failed to read root CA from {:?}", paths.ca_path))?;

        let mut root_store = RootCertStore::empty();
        root_store.add_parsable_certificates(ca_certs);
        if root_store.is_empty() {
            return Err(anyhow!(
                "No valid CA certificates found in {:?}",
                paths.ca_path
            ));
        }

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .context("Failed to build client verifier")?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain, private_key)
            .context("Failed to create TLS config")?;

        let listener = TcpListener::bind(addr).context("Failed to bind listener")?;
        tracing::info!("Echo server bound to {}", listener.local_addr()?);

        Ok(Self {
            tls_config: Arc::new(config),
            listener,
            options: EchoOptions::default(),
        })
    }

    pub fn with_options(mut self, options: EchoOptions) -> Self {
        self.options = options;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `running` is cleared. Each client is served on
    /// its own thread; those threads are not waited for.
    pub fn run_with_shutdown(&self, running: Arc<AtomicBool>) -> Result<()> {
        self.listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        tracing::info!("Echo server listening on {}", self.local_addr()?);

        while running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    tracing::info!("New connection from {}", addr);
                    let config = Arc::clone(&self.tls_config);
                    let options = self.options;
                    let spawned = thread::Builder::new()
                        .name(format!("echo-{}", addr))
                        .spawn(move || {
                            if let Err(e) = serve_client(socket, config, options) {
                                tracing::warn!("Client {} error: {:#}", addr, e);
                            }
                        });
                    if let Err(e) = spawned {
                        tracing::error!("Failed to spawn client thread: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => tracing::error!("Connection error: {}", e),
            }
        }

        tracing::info!("Server shutdown signal received, stopping gracefully");
        Ok(())
    }
}

fn serve_client(socket: TcpStream, config: Arc<ServerConfig>, options: EchoOptions) -> Result<()> {
    // Accepted sockets may inherit non-blocking mode from the listener
    socket.set_nonblocking(false)?;
    let _ = socket.set_nodelay(true);

    let conn = ServerConnection::new(config)?;
    let mut stream = StreamOwned::new(conn, socket);
    let mut buf = [0u8; 4096];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                tracing::info!("Client closed connection cleanly");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::info!("Client went away without close_notify");
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read from TLS stream"),
        };

        tracing::debug!("Echoing {} bytes", n);
        stream.write_all(&buf[..n])?;
        stream.flush()?;

        if options.close_after_first_echo {
            tracing::info!("Closing connection after first echo");
            stream.conn.send_close_notify();
            stream.flush()?;
            linger(&mut stream.sock);
            return Ok(());
        }
    }
}

/// Waits for the client to hang up so unread input does not turn the close
/// into a reset.
fn linger(socket: &mut TcpStream) {
    let _ = socket.shutdown(Shutdown::Write);
    let _ = socket.set_read_timeout(Some(Duration::from_secs(1)));
    let mut sink = [0u8; 512];
    while matches!(socket.read(&mut sink), Ok(n) if n > 0) {}
}
