//! Paired in-memory transport: two channels crossed.
//!
//! Used by the test rigs and in-process embedding. Closing either end
//! drops its senders, which surfaces as EOF on both sides.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};

use super::{Received, Transport, TransportError};
use crate::message::Message;

pub struct PairTransport {
    tx: Mutex<Option<Sender<Message>>>,
    rx: Receiver<Message>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    // Shared between both ends: closing either side closes the connection.
    closed: Arc<AtomicBool>,
}

/// Build both ends of an in-memory connection.
pub fn pair() -> (Arc<PairTransport>, Arc<PairTransport>) {
    let (left_tx, left_rx) = unbounded();
    let (right_tx, right_rx) = unbounded();
    let (left_close_tx, left_close_rx) = unbounded();
    let (right_close_tx, right_close_rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    let left = Arc::new(PairTransport {
        tx: Mutex::new(Some(right_tx)),
        rx: left_rx,
        close_tx: Mutex::new(Some(left_close_tx)),
        close_rx: left_close_rx,
        closed: Arc::clone(&closed),
    });
    let right = Arc::new(PairTransport {
        tx: Mutex::new(Some(left_tx)),
        rx: right_rx,
        close_tx: Mutex::new(Some(right_close_tx)),
        close_rx: right_close_rx,
        closed,
    });
    (left, right)
}

impl Transport for PairTransport {
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let guard = self.tx.lock().expect("sender lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(msg.clone()).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn recv(&self) -> Result<Received, TransportError> {
        crossbeam::select! {
            recv(self.rx) -> msg => Ok(match msg {
                Ok(msg) => Received::Message(msg),
                Err(_) => Received::Eof,
            }),
            recv(self.close_rx) -> _ => Ok(Received::Eof),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Received>, TransportError> {
        if timeout == Duration::MAX {
            return self.recv().map(Some);
        }
        crossbeam::select! {
            recv(self.rx) -> msg => Ok(Some(match msg {
                Ok(msg) => Received::Message(msg),
                Err(_) => Received::Eof,
            })),
            recv(self.close_rx) -> _ => Ok(Some(Received::Eof)),
            default(timeout) => Ok(None),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().expect("sender lock poisoned").take();
        self.close_tx.lock().expect("close lock poisoned").take();
    }
}
