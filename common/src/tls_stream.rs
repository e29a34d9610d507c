use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError},
};

use rustls::ClientConnection;
use tracing::{debug, trace};

use crate::peer::PeerIdentity;

fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Drives the client handshake to completion over a blocking socket
pub fn complete_handshake(conn: &mut ClientConnection, socket: &mut TcpStream) -> io::Result<()> {
    while conn.is_handshaking() {
        if conn.wants_write() {
            conn.write_tls(socket)?;
            continue;
        }
        if !conn.wants_read() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "TLS handshake stalled",
            ));
        }
        if conn.read_tls(socket)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection during the TLS handshake",
            ));
        }
        if let Err(e) = conn.process_new_packets() {
            // Let the peer see our alert before the socket goes away
            let _ = conn.write_tls(socket);
            return Err(tls_error(e));
        }
    }

    // Client Finished (and certificate) may still be queued
    while conn.wants_write() {
        conn.write_tls(socket)?;
    }
    socket.flush()
}

/// rustls state plus ciphertext waiting for the socket, in record order
#[derive(Debug)]
struct TlsState {
    conn:     ClientConnection,
    outgoing: Vec<u8>,
}

impl TlsState {
    /// Moves every record rustls has produced into `outgoing`
    fn seal(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.outgoing)?;
        }
        Ok(())
    }
}

/// What the channel and its reader share.
///
/// `state` is only held to encrypt or decrypt, never across socket I/O.
/// `writer` serialises socket writes; whoever holds it drains `outgoing`
/// until it is empty, so records reach the wire in the order they were
/// sealed. Lock order is `writer` then `state`.
#[derive(Debug)]
struct Shared {
    state:  Mutex<TlsState>,
    writer: Mutex<TcpStream>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TlsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, TcpStream> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_writer(&self) -> Option<MutexGuard<'_, TcpStream>> {
        match self.writer.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Writes queued ciphertext until none is left. Records queued by a
    /// thread that found the writer busy are picked up after release.
    fn flush<'a>(&'a self, mut socket: MutexGuard<'a, TcpStream>) -> io::Result<()> {
        loop {
            loop {
                let pending = std::mem::take(&mut self.state().outgoing);
                if pending.is_empty() {
                    break;
                }
                socket.write_all(&pending)?;
            }
            socket.flush()?;
            drop(socket);

            if self.state().outgoing.is_empty() {
                return Ok(());
            }
            socket = match self.try_writer() {
                Some(socket) => socket,
                None => return Ok(()),
            };
        }
    }
}

/// An established TLS session over TCP.
///
/// The rustls state is shared with at most one [`ChannelReader`]. Socket
/// reads and writes both happen outside the TLS lock, so a large write never
/// stops the reader from draining replies.
#[derive(Debug)]
pub struct SecureChannel {
    shared:    Arc<Shared>,
    socket:    TcpStream,
    peer_addr: SocketAddr,
    peer:      Option<PeerIdentity>,
}

impl SecureChannel {
    /// Wraps a connection whose handshake has completed on `socket`
    pub fn from_client(socket: TcpStream, mut conn: ClientConnection) -> io::Result<Self> {
        let peer_addr = socket.peer_addr()?;
        let peer = conn
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|cert| PeerIdentity::from_der(cert.as_ref()));

        // Whole messages are sealed at once; `outgoing` is the buffer
        conn.set_buffer_limit(None);

        Ok(Self {
            shared: Arc::new(Shared {
                state:  Mutex::new(TlsState {
                    conn,
                    outgoing: Vec::new(),
                }),
                writer: Mutex::new(socket.try_clone()?),
            }),
            socket,
            peer_addr,
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Identity from the peer's leaf certificate, if it could be parsed
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    /// Read half for the receive loop
    pub fn reader(&self) -> io::Result<ChannelReader> {
        Ok(ChannelReader {
            shared:  Arc::clone(&self.shared),
            socket:  self.socket.try_clone()?,
            scratch: vec![0u8; 4096],
        })
    }

    /// Encrypts `bytes` and pushes every resulting record to the socket.
    ///
    /// `then` runs once the records are sealed and before any of them is
    /// written, so nothing the peer sends in reply can be decrypted first.
    pub fn send_and_then<F: FnOnce()>(&mut self, bytes: &[u8], then: F) -> io::Result<()> {
        let socket = self.shared.writer();
        {
            let mut state = self.shared.state();
            state.conn.writer().write_all(bytes)?;
            state.seal()?;
            then();
        }
        self.shared.flush(socket)
    }

    /// Sends close_notify. Failures are logged and ignored since the socket
    /// may already be shut.
    pub fn close_notify(&mut self) {
        let socket = self.shared.writer();
        {
            let mut state = self.shared.state();
            state.conn.send_close_notify();
            if let Err(e) = state.seal() {
                debug!("close_notify not sealed: {}", e);
                return;
            }
        }
        match self.shared.flush(socket) {
            Ok(()) => trace!("close_notify sent to {}", self.peer_addr),
            Err(e) => debug!("close_notify not delivered: {}", e),
        }
    }

    /// Wakes a reader blocked on this socket; it will observe end-of-stream
    pub fn interrupt_reads(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Read) {
            debug!("Read shutdown: {}", e);
        }
    }
}

/// Blocking plaintext reader sharing the channel's TLS state
pub struct ChannelReader {
    shared:  Arc<Shared>,
    socket:  TcpStream,
    scratch: Vec<u8>,
}

impl ChannelReader {
    /// Hands the ciphertext in `self.scratch[..n]` to rustls. `n == 0`
    /// records end-of-stream.
    fn ingest(&mut self, n: usize) -> io::Result<()> {
        let replied = {
            let mut state = self.shared.state();
            let mut pending = &self.scratch[..n];
            loop {
                state.conn.read_tls(&mut pending)?;
                state.conn.process_new_packets().map_err(tls_error)?;
                if pending.is_empty() {
                    break;
                }
            }

            // Post-handshake traffic such as key updates can require a reply
            let replied = state.conn.wants_write();
            state.seal()?;
            replied
        };

        // A busy writer sends the reply when it finishes; never wait for it
        // here, the sender may be blocked until this loop drains the socket
        if replied {
            if let Some(socket) = self.shared.try_writer() {
                self.shared.flush(socket)?;
            }
        }
        Ok(())
    }
}

impl Read for ChannelReader {
    /// `Ok(0)` means the peer sent close_notify; a peer that vanished
    /// without it surfaces as `UnexpectedEof`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.shared.state().conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            let n = match self.socket.read(&mut self.scratch) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.ingest(n)?;
        }
    }
}
