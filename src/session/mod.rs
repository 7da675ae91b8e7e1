//! Sessions: persistent evaluation state, the process-wide registry, and
//! the `session` middleware (`clone`, `close`, `ls-sessions`, default wrap).
//!
//! The registry is a snapshot map swapped by compare-and-swap, so lookups
//! never block mutations. Each session owns its standard-stream adapters,
//! bound to the transport the session was cloned over.

pub mod stdio;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use uuid::Uuid;

use crate::eval::ExecState;
use crate::message::Data;
use crate::middleware::{Anchor, Descriptor, Middleware, Next, OpInfo, Request};
use crate::runtime::{CancelToken, Value};
use crate::transport::Transport;

pub use stdio::{OutSink, SinkWriter, StdinMailbox, StdinReader, StreamKind};

/// Baseline output buffer threshold for fresh sessions, in bytes.
pub const DEFAULT_OUT_LIMIT: usize = 1024;

/// Namespace a fresh session starts in.
pub const BASELINE_NS: &str = "user";

/// The dynamic bindings a session snapshots between evaluations.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub ns: String,
    pub results: [Option<Value>; 3],
    pub last_error: Option<String>,
    pub vars: BTreeMap<String, Value>,
}

impl Default for Snapshot {
    fn default() -> Snapshot {
        Snapshot {
            ns: BASELINE_NS.to_string(),
            results: [None, None, None],
            last_error: None,
            vars: BTreeMap::new(),
        }
    }
}

/// The request currently being evaluated in a session, if any. Stream
/// adapters read the id to tag asynchronous output; the interrupt handler
/// uses the token and the eval's own transport.
#[derive(Clone)]
pub struct CurrentEval {
    pub id: Option<String>,
    pub cancel: CancelToken,
    pub transport: Option<Arc<dyn Transport>>,
}

pub type CurrentSlot = Arc<Mutex<Option<CurrentEval>>>;

/// A named container for evaluation state.
pub struct Session {
    id: String,
    state: Mutex<Snapshot>,
    out_limit: Arc<AtomicUsize>,
    current: CurrentSlot,
    exec: Mutex<ExecState>,
    stdout: OutSink,
    stderr: OutSink,
    stdin: StdinMailbox,
}

impl Session {
    /// Create a session, snapshotting `parent` when given, with fresh
    /// stream adapters bound to `transport`.
    pub fn create(parent: Option<&Session>, transport: Arc<dyn Transport>) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let snapshot = parent.map(Session::snapshot).unwrap_or_default();
        let out_limit = Arc::new(AtomicUsize::new(
            parent.map(Session::out_limit).unwrap_or(DEFAULT_OUT_LIMIT),
        ));
        let current: CurrentSlot = Arc::new(Mutex::new(None));
        let stdout = OutSink::new(
            id.clone(),
            StreamKind::Out,
            Arc::clone(&transport),
            Arc::clone(&current),
            Arc::clone(&out_limit),
        );
        let stderr = OutSink::new(
            id.clone(),
            StreamKind::Err,
            Arc::clone(&transport),
            Arc::clone(&current),
            Arc::clone(&out_limit),
        );
        let stdin = StdinMailbox::new(id.clone(), transport);
        Arc::new(Session {
            id,
            state: Mutex::new(snapshot),
            out_limit,
            current,
            exec: Mutex::new(ExecState::default()),
            stdout,
            stderr,
            stdin,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().expect("session state lock poisoned").clone()
    }

    /// Merge a mutated dynamic context back in.
    pub fn restore(&self, snapshot: Snapshot) {
        *self.state.lock().expect("session state lock poisoned") = snapshot;
    }

    pub fn out_limit(&self) -> usize {
        self.out_limit.load(Ordering::Acquire)
    }

    pub fn set_out_limit(&self, limit: usize) {
        self.out_limit.store(limit, Ordering::Release);
    }

    pub fn stdout(&self) -> &OutSink {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutSink {
        &self.stderr
    }

    pub fn stdin(&self) -> &StdinMailbox {
        &self.stdin
    }

    pub(crate) fn exec(&self) -> &Mutex<ExecState> {
        &self.exec
    }

    /// Install the current-request context; stream output is tagged with
    /// `id` until [`end_eval`](Session::end_eval).
    pub fn begin_eval(&self, id: Option<String>, transport: Arc<dyn Transport>) -> CancelToken {
        let cancel = CancelToken::new();
        let mut current = self.current.lock().expect("current slot poisoned");
        *current = Some(CurrentEval {
            id,
            cancel: cancel.clone(),
            transport: Some(transport),
        });
        cancel
    }

    /// Clear the current-request context. Output produced later is sent
    /// untagged.
    pub fn end_eval(&self) {
        self.current.lock().expect("current slot poisoned").take();
    }

    pub fn running_eval(&self) -> Option<CurrentEval> {
        self.current.lock().expect("current slot poisoned").clone()
    }
}

/// Registry of live sessions; mutations swap the whole snapshot map.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: ArcSwap<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.load().get(id).cloned()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.rcu(|sessions| {
            let mut next = HashMap::clone(sessions);
            next.insert(session.id().to_string(), Arc::clone(&session));
            next
        });
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let previous = self.sessions.rcu(|sessions| {
            let mut next = HashMap::clone(sessions);
            next.remove(id);
            next
        });
        previous.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.load().keys().cloned().collect()
    }
}

/// Middleware owning session lifecycle ops and the default wrap that
/// resolves `session` ids for everything else.
pub struct SessionMiddleware {
    registry: Arc<SessionRegistry>,
}

impl SessionMiddleware {
    pub fn new(registry: Arc<SessionRegistry>) -> SessionMiddleware {
        SessionMiddleware { registry }
    }

    fn clone_session(&self, req: &Request) {
        let parent = req
            .msg
            .session_id()
            .and_then(|id| self.registry.get(id));
        let session = Session::create(parent.as_deref(), Arc::clone(&req.transport));
        self.registry.insert(Arc::clone(&session));
        tracing::debug!(session = session.id(), "session cloned");
        req.send(
            &req.msg
                .reply()
                .with("new-session", session.id())
                .with_status(&["done"]),
        );
    }

    fn close_session(&self, req: &Request) {
        let removed = req.msg.session_id().and_then(|id| self.registry.remove(id));
        match removed {
            Some(session) => {
                // The running evaluation completes and its tail messages
                // are delivered; tasks still waiting in the queue are
                // abandoned, and the stdin pipe is torn down so blocked
                // reads terminate.
                session
                    .exec()
                    .lock()
                    .expect("exec lock poisoned")
                    .queue
                    .clear();
                session.stdin().close();
                tracing::debug!(session = session.id(), "session closed");
                req.send(&req.msg.reply().with_status(&["done", "session-closed"]));
            }
            None => req.send(&req.msg.reply().with_status(&["error", "unknown-session"])),
        }
    }

    fn ls_sessions(&self, req: &Request) {
        let sessions: Vec<Data> = self.registry.ids().into_iter().map(Data::from).collect();
        req.send(
            &req.msg
                .reply()
                .with("sessions", sessions)
                .with_status(&["done"]),
        );
    }
}

impl Middleware for SessionMiddleware {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: "session",
            requires: Vec::new(),
            expects: vec![
                Anchor::Op("eval"),
                Anchor::Op("interrupt"),
                Anchor::Op("stdin"),
                Anchor::Op("load-file"),
            ],
            handles: BTreeMap::from([
                (
                    "clone",
                    OpInfo {
                        doc: "Clone a session, or create one from the baseline state.",
                        requires: vec![],
                        optional: vec![("session", "Parent session to snapshot from.")],
                        returns: vec![("new-session", "Id of the created session.")],
                    },
                ),
                (
                    "close",
                    OpInfo {
                        doc: "Close a session; the running evaluation completes.",
                        requires: vec![("session", "Session to close.")],
                        optional: vec![],
                        returns: vec![],
                    },
                ),
                (
                    "ls-sessions",
                    OpInfo {
                        doc: "List the ids of all registered sessions.",
                        requires: vec![],
                        optional: vec![],
                        returns: vec![("sessions", "Registered session ids.")],
                    },
                ),
            ]),
        }
    }

    fn handle(&self, req: Request, next: Next<'_>) {
        match req.msg.op() {
            Some("clone") => self.clone_session(&req),
            Some("close") => self.close_session(&req),
            Some("ls-sessions") => self.ls_sessions(&req),
            _ => match req.msg.session_id() {
                Some(id) => match self.registry.get(id) {
                    Some(session) => next.forward(req.with_session(session)),
                    None => {
                        req.send(&req.msg.reply().with_status(&["error", "unknown-session"]));
                    }
                },
                None => {
                    // Ephemeral session for the lifetime of this message;
                    // the derived message carries its id so responses are
                    // tagged like any other.
                    let session = Session::create(None, Arc::clone(&req.transport));
                    let mut enriched = req.msg.clone();
                    enriched.insert("session", session.id());
                    next.forward(req.with_msg(enriched).with_session(session));
                }
            },
        }
    }
}
