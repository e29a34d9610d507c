//! Receive loop: reads the channel until it ends and reports what arrives.

use std::{
    io::{self, Read},
    sync::Arc,
    thread::{self, JoinHandle},
};

use latchkey_common::{error::RuntimeError, framing::Framing, tls_stream::ChannelReader};
use tracing::{debug, info, warn};

use crate::{event::SessionEvent, session::Shared};

enum Ending {
    /// Peer sent close_notify
    Closed,
    /// TCP ended without close_notify
    Vanished,
    Broken(RuntimeError),
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    reader: ChannelReader,
    framing: Framing,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("latchkey-recv".into())
        .spawn(move || run(&shared, reader, framing))
}

fn run(shared: &Shared, mut reader: ChannelReader, framing: Framing) {
    let mut decoder = framing.decoder();
    let mut buf = vec![0u8; framing.read_chunk()];

    let ending = loop {
        if !shared.is_running() {
            debug!("Receive loop told to stop");
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => break Ending::Closed,
            Ok(n) => match decoder.push(&buf[..n]) {
                Ok(messages) => {
                    for message in messages {
                        shared.emit(SessionEvent::MessageReceived(message));
                    }
                }
                Err(e) => break Ending::Broken(RuntimeError::ChannelBroken(e)),
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ending::Vanished,
            Err(e) => break Ending::Broken(RuntimeError::ChannelBroken(e)),
        }
    };

    if !matches!(ending, Ending::Broken(_)) {
        if let Some(rest) = decoder.finish() {
            shared.emit(SessionEvent::MessageReceived(rest));
        }
    }

    if shared.clear_running() {
        match &ending {
            Ending::Closed => info!("Peer closed the channel"),
            Ending::Vanished => warn!("Peer went away without close_notify"),
            Ending::Broken(err) => warn!("{}", err),
        }
        shared.emit(SessionEvent::ServerGoneDown);
    } else {
        debug!("Receive loop finished after local disconnect");
    }
    shared.wake_owner();
}
