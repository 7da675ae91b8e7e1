//! Per-session standard stream adapters.
//!
//! Out/err sinks buffer up to the session's out-limit and flush as
//! `{session, out|err, id?}` messages, tagging the currently-evaluating
//! request when one is active. The stdin mailbox announces `need-input`
//! before blocking and is fed by the `stdin` op.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::message::Message;
use crate::runtime::ReadLine;
use crate::session::CurrentSlot;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Out,
    Err,
}

impl StreamKind {
    fn key(self) -> &'static str {
        match self {
            StreamKind::Out => "out",
            StreamKind::Err => "err",
        }
    }
}

#[derive(Clone)]
pub struct OutSink {
    inner: Arc<SinkShared>,
}

struct SinkShared {
    session_id: String,
    kind: StreamKind,
    transport: Arc<dyn Transport>,
    current: CurrentSlot,
    limit: Arc<AtomicUsize>,
    buf: Mutex<Vec<u8>>,
}

impl OutSink {
    pub(super) fn new(
        session_id: String,
        kind: StreamKind,
        transport: Arc<dyn Transport>,
        current: CurrentSlot,
        limit: Arc<AtomicUsize>,
    ) -> OutSink {
        OutSink {
            inner: Arc::new(SinkShared {
                session_id,
                kind,
                transport,
                current,
                limit,
                buf: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Drain the buffer and ship it, if there is anything pending.
    pub fn flush_pending(&self) {
        let mut buf = self.inner.buf.lock().expect("sink buffer lock poisoned");
        self.drain_and_send(&mut buf);
    }

    /// An `io::Write` view for handing to the runtime.
    pub fn writer(&self) -> SinkWriter {
        SinkWriter(self.clone())
    }

    fn drain_and_send(&self, buf: &mut Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        let drained = std::mem::take(buf);
        let text = String::from_utf8_lossy(&drained).into_owned();
        let mut msg = Message::new()
            .with("session", self.inner.session_id.as_str())
            .with(self.inner.kind.key(), text);
        let current = self.inner.current.lock().expect("current slot poisoned");
        if let Some(eval) = current.as_ref()
            && let Some(id) = eval.id.as_deref()
        {
            msg.insert("id", id);
        }
        drop(current);
        if let Err(err) = self.inner.transport.send(&msg) {
            tracing::debug!(error = %err, "stream flush dropped");
        }
    }
}

pub struct SinkWriter(OutSink);

impl io::Write for SinkWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let inner = &self.0.inner;
        let mut buf = inner.buf.lock().expect("sink buffer lock poisoned");
        buf.extend_from_slice(bytes);
        if buf.len() >= inner.limit.load(Ordering::Acquire) {
            self.0.drain_and_send(&mut buf);
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush_pending();
        Ok(())
    }
}

/// The session's standard input: a pipe fed across requests by `stdin` ops.
#[derive(Clone)]
pub struct StdinMailbox {
    inner: Arc<StdinShared>,
}

struct StdinShared {
    session_id: String,
    transport: Arc<dyn Transport>,
    state: Mutex<StdinState>,
    cond: Condvar,
}

#[derive(Default)]
struct StdinState {
    buffer: String,
    closed: bool,
}

impl StdinMailbox {
    pub(super) fn new(session_id: String, transport: Arc<dyn Transport>) -> StdinMailbox {
        StdinMailbox {
            inner: Arc::new(StdinShared {
                session_id,
                transport,
                state: Mutex::new(StdinState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Append input and wake blocked readers.
    pub fn feed(&self, text: &str) {
        let mut state = self.inner.state.lock().expect("stdin lock poisoned");
        state.buffer.push_str(text);
        self.inner.cond.notify_all();
    }

    /// No more input will arrive; blocked readers drain and then see EOF.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("stdin lock poisoned");
        state.closed = true;
        self.inner.cond.notify_all();
    }

    pub fn reader(&self) -> StdinReader {
        StdinReader(self.clone())
    }
}

pub struct StdinReader(StdinMailbox);

impl ReadLine for StdinReader {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let inner = &self.0.inner;
        let mut state = inner.state.lock().expect("stdin lock poisoned");
        loop {
            if let Some(pos) = state.buffer.find('\n') {
                let line: String = state.buffer.drain(..=pos).collect();
                return Ok(Some(line.trim_end_matches('\n').to_string()));
            }
            if state.closed {
                if state.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut state.buffer)));
            }
            // The read would block: announce, then wait to be fed.
            drop(state);
            let announce = Message::new()
                .with("session", inner.session_id.as_str())
                .with_status(&["need-input"]);
            if let Err(err) = inner.transport.send(&announce) {
                tracing::debug!(error = %err, "need-input announcement dropped");
            }
            state = inner.state.lock().expect("stdin lock poisoned");
            if state.buffer.contains('\n') || state.closed {
                continue;
            }
            state = inner.cond.wait(state).expect("stdin lock poisoned");
        }
    }
}
