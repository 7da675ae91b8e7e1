//! Bencode transport over a TCP stream.
//!
//! One background reader thread decodes messages and posts them to a
//! bounded mailbox; the foreground `recv` takes from it. Stream end posts an
//! EOF sentinel, a decode failure posts the error, and whichever terminal
//! arrives first is repeated on every later `recv`.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};

use super::{Received, Transport, TransportError};
use crate::bencode::{self, Decoder};
use crate::message::{self, Message};

/// Capacity of the inbound mailbox; the reader blocks when the consumer
/// lags this far behind.
pub const INBOX_DEPTH: usize = 32;

enum Inbound {
    Message(Message),
    Terminated(Terminal),
}

#[derive(Clone)]
enum Terminal {
    Eof,
    Failed(TransportError),
}

pub struct SocketTransport {
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    inbox: Receiver<Inbound>,
    terminal: Mutex<Option<Terminal>>,
}

impl SocketTransport {
    /// Wrap a connected stream and start its reader thread.
    pub fn start(
        stream: TcpStream,
        max_message_bytes: usize,
    ) -> std::io::Result<Arc<SocketTransport>> {
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;
        let writer = Mutex::new(stream.try_clone()?);
        let (inbound_tx, inbox) = bounded(INBOX_DEPTH);
        thread::spawn(move || run_reader_loop(reader_stream, inbound_tx, max_message_bytes));
        Ok(Arc::new(SocketTransport {
            stream,
            writer,
            inbox,
            terminal: Mutex::new(None),
        }))
    }

    pub fn connect(
        addr: impl ToSocketAddrs,
        max_message_bytes: usize,
    ) -> std::io::Result<Arc<SocketTransport>> {
        SocketTransport::start(TcpStream::connect(addr)?, max_message_bytes)
    }

    fn settle(&self, terminal: Terminal) -> Result<Received, TransportError> {
        let mut slot = self.terminal.lock().expect("terminal lock poisoned");
        let terminal = slot.get_or_insert(terminal).clone();
        match terminal {
            Terminal::Eof => Ok(Received::Eof),
            Terminal::Failed(err) => Err(err),
        }
    }

    fn settled(&self) -> Option<Result<Received, TransportError>> {
        let slot = self.terminal.lock().expect("terminal lock poisoned");
        slot.as_ref().map(|terminal| match terminal {
            Terminal::Eof => Ok(Received::Eof),
            Terminal::Failed(err) => Err(err.clone()),
        })
    }
}

impl Transport for SocketTransport {
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let wire = message::to_wire(msg).map_err(|err| TransportError::Protocol(err.to_string()))?;
        let encoded = bencode::encode(&wire);
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        writer
            .write_all(&encoded)
            .and_then(|()| writer.flush())
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn recv(&self) -> Result<Received, TransportError> {
        if let Some(out) = self.settled() {
            return out;
        }
        match self.inbox.recv() {
            Ok(Inbound::Message(msg)) => Ok(Received::Message(msg)),
            Ok(Inbound::Terminated(terminal)) => self.settle(terminal),
            Err(_) => self.settle(Terminal::Eof),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Received>, TransportError> {
        if timeout == Duration::MAX {
            return self.recv().map(Some);
        }
        if let Some(out) = self.settled() {
            return out.map(Some);
        }
        match self.inbox.recv_timeout(timeout) {
            Ok(Inbound::Message(msg)) => Ok(Some(Received::Message(msg))),
            Ok(Inbound::Terminated(terminal)) => self.settle(terminal).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => self.settle(Terminal::Eof).map(Some),
        }
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn run_reader_loop(stream: TcpStream, inbound_tx: Sender<Inbound>, max_message_bytes: usize) {
    let mut decoder = Decoder::new(stream, max_message_bytes);
    loop {
        let terminal = match decoder.decode_next() {
            Ok(Some(wire)) => match message::from_wire(wire) {
                Ok(msg) => {
                    if inbound_tx.send(Inbound::Message(msg)).is_err() {
                        return;
                    }
                    continue;
                }
                Err(err) => Terminal::Failed(TransportError::Protocol(err.to_string())),
            },
            Ok(None) => Terminal::Eof,
            // A dying socket is a closed connection, not a grammar
            // violation.
            Err(err) if err.is_disconnect() => Terminal::Eof,
            Err(err) => Terminal::Failed(TransportError::Protocol(err.to_string())),
        };
        let _ = inbound_tx.send(Inbound::Terminated(terminal));
        return;
    }
}
