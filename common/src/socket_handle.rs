//! Shared view of a session's TCP socket that any thread may close.
//!
//! The owner keeps the stream it reads and writes; the handle holds a
//! duplicate so a foreign thread can shut the socket down while the owner is
//! blocked in connect, handshake or read. Closing is idempotent.

use std::{
    io,
    net::{Shutdown, TcpStream},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, trace};

enum Slot {
    /// No socket yet; a close arriving now is remembered
    Vacant,
    Open(TcpStream),
    Closed,
}

pub struct SocketHandle {
    slot: Mutex<Slot>,
}

impl Default for SocketHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            Slot::Vacant => "vacant",
            Slot::Open(_) => "open",
            Slot::Closed => "closed",
        };
        f.debug_struct("SocketHandle").field("state", &state).finish()
    }
}

impl SocketHandle {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Vacant),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `stream` so that [`close`](Self::close) can reach it.
    ///
    /// Fails with `ConnectionAborted` when the handle was closed before the
    /// socket existed.
    pub fn attach(&self, stream: &TcpStream) -> io::Result<()> {
        let mut slot = self.lock();
        match &*slot {
            Slot::Closed => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "disconnect requested before the socket was registered",
            )),
            Slot::Open(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a socket is already registered",
            )),
            Slot::Vacant => {
                *slot = Slot::Open(stream.try_clone()?);
                trace!("Socket registered");
                Ok(())
            }
        }
    }

    /// Shuts the socket down and drops the registered descriptor.
    ///
    /// Returns `true` only for the call that actually closed an open socket.
    pub fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lock(), Slot::Closed);
        match previous {
            Slot::Open(stream) => {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    // NotConnected: the peer got there first
                    debug!("Socket shutdown: {}", e);
                }
                true
            }
            Slot::Vacant | Slot::Closed => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.lock(), Slot::Closed)
    }

    /// Makes the handle ready for a fresh attempt
    pub fn rearm(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Slot::Vacant);
        if let Slot::Open(stream) = previous {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read, net::TcpListener, thread};

    use super::*;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_close_is_idempotent() {
        let (client, _server) = pair();
        let handle = SocketHandle::new();
        handle.attach(&client).unwrap();

        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
    }

    #[test]
    fn test_close_before_attach_aborts_attach() {
        let (client, _server) = pair();
        let handle = SocketHandle::new();

        assert!(!handle.close());
        let err = handle.attach(&client).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_rearm_allows_new_attach() {
        let (client, _server) = pair();
        let handle = SocketHandle::new();
        handle.close();
        handle.rearm();

        handle.attach(&client).unwrap();
        assert!(!handle.is_closed());
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (client, _server) = pair();
        let handle = SocketHandle::new();
        handle.attach(&client).unwrap();

        let mut reader = client.try_clone().unwrap();
        let blocked = thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read(&mut buf)
        });

        handle.close();
        let outcome = blocked.join().unwrap();
        assert!(matches!(outcome, Ok(0) | Err(_)));
    }
}
