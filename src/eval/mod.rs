//! Interruptible evaluation: per-session FIFO queues over a shared worker
//! pool, and the `interruptible-eval` middleware handling `eval` and
//! `interrupt`.
//!
//! Admission is atomic: the submitting thread dispatches the head task only
//! when the session was idle; a finishing worker pops and reschedules the
//! next task. There is no per-session thread.

pub mod pool;

use std::collections::{BTreeMap, VecDeque};
use std::io::Write as _;
use std::sync::Arc;

use crate::message::{Data, Message};
use crate::middleware::{Anchor, Descriptor, Middleware, Next, OpInfo, Request};
use crate::runtime::{CancelToken, EvalContext, EvalError, LanguageRuntime};
use crate::session::{Session, Snapshot};

pub use pool::WorkerPool;

/// Per-session execution metadata: the pending FIFO and whether a worker
/// currently owns the session.
#[derive(Default)]
pub struct ExecState {
    pub queue: VecDeque<Request>,
    pub running: bool,
}

struct EvalShared {
    pool: Arc<WorkerPool>,
    runtime: Arc<dyn LanguageRuntime>,
}

/// Middleware evaluating `code` inside the request's session.
pub struct InterruptibleEval {
    shared: Arc<EvalShared>,
}

impl InterruptibleEval {
    pub fn new(pool: Arc<WorkerPool>, runtime: Arc<dyn LanguageRuntime>) -> InterruptibleEval {
        InterruptibleEval {
            shared: Arc::new(EvalShared { pool, runtime }),
        }
    }

    fn submit(&self, req: Request) {
        let Some(session) = req.session.clone() else {
            req.send(&req.msg.reply().with_status(&["error", "unknown-session"]));
            return;
        };
        if !matches!(req.msg.get("code"), Some(Data::Str(_) | Data::List(_))) {
            req.send(&req.msg.reply().with_status(&["error", "no-code", "done"]));
            return;
        }
        if let Some(ns) = req.msg.get_str("ns")
            && !self.shared.runtime.ns_exists(ns)
        {
            req.send(
                &req.msg
                    .reply()
                    .with_status(&["error", "namespace-not-found", "done"]),
            );
            return;
        }

        let dispatch_now = {
            let mut exec = session.exec().lock().expect("exec lock poisoned");
            exec.queue.push_back(req);
            if exec.running {
                false
            } else {
                exec.running = true;
                true
            }
        };
        if dispatch_now {
            dispatch(&self.shared, session);
        }
    }

    fn interrupt(&self, req: Request) {
        let running = req.session.as_ref().and_then(|session| session.running_eval());
        let Some(session) = req.session.as_ref() else {
            req.send(&req.msg.reply().with_status(&["done", "session-idle"]));
            return;
        };
        match running {
            None => {
                req.send(&req.msg.reply().with_status(&["done", "session-idle"]));
            }
            Some(current) => {
                if let Some(requested) = req.msg.get_str("interrupt-id")
                    && current.id.as_deref() != Some(requested)
                {
                    req.send(
                        &req.msg
                            .reply()
                            .with_status(&["error", "interrupt-id-mismatch", "done"]),
                    );
                    return;
                }
                // The interrupted tag must reach the eval's channel before
                // that eval's own done.
                let mut note = Message::new()
                    .with("session", session.id())
                    .with_status(&["interrupted"]);
                if let Some(id) = current.id.as_deref() {
                    note.insert("id", id);
                }
                let target = current
                    .transport
                    .clone()
                    .unwrap_or_else(|| Arc::clone(&req.transport));
                if let Err(err) = target.send(&note) {
                    tracing::debug!(error = %err, "interrupted tag dropped");
                }
                current.cancel.cancel();
                req.send(&req.msg.reply().with_status(&["done"]));
            }
        }
    }
}

impl Middleware for InterruptibleEval {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: "interruptible-eval",
            requires: vec![Anchor::Op("clone"), Anchor::Op("close")],
            expects: Vec::new(),
            handles: BTreeMap::from([
                (
                    "eval",
                    OpInfo {
                        doc: "Evaluate code in the session, streaming results.",
                        requires: vec![
                            ("code", "Source text, read as a sequence of forms."),
                            ("session", "Session to evaluate in."),
                        ],
                        optional: vec![
                            ("id", "Request correlation token."),
                            ("ns", "Namespace to evaluate in."),
                        ],
                        returns: vec![
                            ("value", "One message per evaluated form."),
                            ("ns", "Namespace after each form."),
                        ],
                    },
                ),
                (
                    "interrupt",
                    OpInfo {
                        doc: "Interrupt the session's running evaluation.",
                        requires: vec![("session", "Session to interrupt.")],
                        optional: vec![("interrupt-id", "Id of the eval to cancel.")],
                        returns: vec![],
                    },
                ),
            ]),
        }
    }

    fn handle(&self, req: Request, next: Next<'_>) {
        match req.msg.op() {
            Some("eval") => self.submit(req),
            Some("interrupt") => self.interrupt(req),
            _ => next.forward(req),
        }
    }
}

fn dispatch(shared: &Arc<EvalShared>, session: Arc<Session>) {
    let shared = Arc::clone(shared);
    let pool = Arc::clone(&shared.pool);
    pool.spawn(move || run_queued(shared, session));
}

/// Worker entry: run the queue head, then hand the session back to the pool
/// if more work arrived meanwhile.
fn run_queued(shared: Arc<EvalShared>, session: Arc<Session>) {
    let task = {
        let mut exec = session.exec().lock().expect("exec lock poisoned");
        exec.queue.pop_front()
    };
    if let Some(req) = task {
        evaluate(&shared, &session, &req);
    }
    let more = {
        let mut exec = session.exec().lock().expect("exec lock poisoned");
        if exec.queue.is_empty() {
            exec.running = false;
            false
        } else {
            true
        }
    };
    if more {
        dispatch(&shared, session);
    }
}

/// One evaluation task: bind the snapshot, stream per-form results, and
/// run the terminal actions on every exit path.
fn evaluate(shared: &EvalShared, session: &Arc<Session>, req: &Request) {
    let cancel = session.begin_eval(
        req.msg.id().map(str::to_string),
        Arc::clone(&req.transport),
    );
    let mut snapshot = session.snapshot();
    if let Some(ns) = req.msg.get_str("ns") {
        snapshot.ns = ns.to_string();
    }

    run_forms(shared, session, req, &mut snapshot, &cancel);

    session.stdout().flush_pending();
    session.stderr().flush_pending();
    session.restore(snapshot);
    session.end_eval();
    req.send(&req.msg.reply().with_status(&["done"]));
}

fn run_forms(
    shared: &EvalShared,
    session: &Arc<Session>,
    req: &Request,
    snapshot: &mut Snapshot,
    cancel: &CancelToken,
) {
    let forms = match read_code(shared, &req.msg) {
        Ok(forms) => forms,
        Err(err) => {
            report_eval_error(session, req, snapshot, &err);
            return;
        }
    };

    let mut stdout = session.stdout().writer();
    let mut stderr = session.stderr().writer();
    let mut stdin = session.stdin().reader();

    for form in &forms {
        if cancel.is_cancelled() {
            // Interrupted: no slot rotation, no eval-error; the interrupt
            // path has already emitted the interrupted tag.
            return;
        }
        let result = {
            let mut ctx = EvalContext {
                ns: &mut snapshot.ns,
                results: &snapshot.results,
                last_error: &snapshot.last_error,
                vars: &mut snapshot.vars,
                stdout: &mut stdout,
                stderr: &mut stderr,
                stdin: &mut stdin,
                cancel,
            };
            shared.runtime.eval(form, &mut ctx)
        };
        match result {
            Ok(value) => {
                snapshot.results = [
                    Some(value.clone()),
                    snapshot.results[0].take(),
                    snapshot.results[1].take(),
                ];
                session.stdout().flush_pending();
                session.stderr().flush_pending();
                req.send(
                    &req.msg
                        .reply()
                        .with("value", value)
                        .with("ns", snapshot.ns.clone()),
                );
            }
            Err(err) if err.is_interrupt() => return,
            Err(err) => {
                report_eval_error(session, req, snapshot, &err);
                return;
            }
        }
    }
}

/// `code` is either source text or a pre-parsed list of form strings.
fn read_code(
    shared: &EvalShared,
    msg: &Message,
) -> Result<Vec<crate::runtime::Value>, EvalError> {
    match msg.get("code") {
        Some(Data::Str(text)) => shared.runtime.read_forms(text),
        Some(Data::List(items)) => {
            let mut forms = Vec::new();
            for item in items {
                match item {
                    Data::Str(text) => forms.append(&mut shared.runtime.read_forms(text)?),
                    other => {
                        return Err(EvalError::Syntax(format!(
                            "code list holds a non-string element: {other:?}"
                        )));
                    }
                }
            }
            Ok(forms)
        }
        _ => unreachable!("code presence validated at submission"),
    }
}

fn report_eval_error(
    session: &Arc<Session>,
    req: &Request,
    snapshot: &mut Snapshot,
    err: &EvalError,
) {
    snapshot.last_error = Some(err.to_string());
    req.send(
        &req.msg
            .reply()
            .with("ex", err.ex_name())
            .with("root-ex", err.root_ex_name())
            .with_status(&["eval-error"]),
    );
    let mut stderr = session.stderr().writer();
    let _ = writeln!(stderr, "{err}");
}
