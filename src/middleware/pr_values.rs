//! Print outgoing `value` slots into reader-readable strings.
//!
//! Wraps the request's transport in a decorator; downstream handlers emit
//! raw runtime values and this layer renders them just before the wire.

use std::sync::Arc;
use std::time::Duration;

use super::{Anchor, Descriptor, Middleware, Next, Request};
use crate::message::{Data, Message};
use crate::transport::{Received, Transport, TransportError};

#[derive(Default)]
pub struct PrValues;

impl PrValues {
    pub fn new() -> PrValues {
        PrValues
    }
}

impl Middleware for PrValues {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: "pr-values",
            requires: Vec::new(),
            expects: vec![Anchor::Op("eval")],
            handles: Default::default(),
        }
    }

    fn handle(&self, req: Request, next: Next<'_>) {
        let printing = Arc::new(PrintingTransport {
            inner: Arc::clone(&req.transport),
        });
        next.forward(req.with_transport(printing));
    }
}

struct PrintingTransport {
    inner: Arc<dyn Transport>,
}

impl Transport for PrintingTransport {
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if let Some(Data::Value(value)) = msg.get("value") {
            let mut printed = msg.clone();
            printed.insert("value", value.print());
            return self.inner.send(&printed);
        }
        self.inner.send(msg)
    }

    fn recv(&self) -> Result<Received, TransportError> {
        self.inner.recv()
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Received>, TransportError> {
        self.inner.recv_timeout(timeout)
    }

    fn close(&self) {
        self.inner.close()
    }
}
