//! Middleware pipeline: descriptors, topological linearization, dispatch.
//!
//! Handlers compose by closing over a `Next`; the composed chain runs
//! outermost-first and bottoms out in the `unknown-op` responder. The stack
//! is built once at startup from descriptor `requires`/`expects` edges and
//! any inconsistency fails fast with [`ConfigError`].

pub mod describe;
pub mod load_file;
pub mod pr_values;
pub mod stdin;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::message::Message;
use crate::session::Session;
use crate::transport::Transport;

pub use describe::Describe;
pub use load_file::LoadFile;
pub use pr_values::PrValues;
pub use stdin::AddStdin;

/// A position reference inside a descriptor: either an op name resolved to
/// the handler providing it, or a handler named directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anchor {
    Op(&'static str),
    Handler(&'static str),
}

impl Anchor {
    fn label(&self) -> String {
        match self {
            Anchor::Op(op) => format!("op '{op}'"),
            Anchor::Handler(name) => format!("handler '{name}'"),
        }
    }
}

/// Documentation for one handled op, surfaced by `describe`.
#[derive(Clone, Debug, Default)]
pub struct OpInfo {
    pub doc: &'static str,
    pub requires: Vec<(&'static str, &'static str)>,
    pub optional: Vec<(&'static str, &'static str)>,
    pub returns: Vec<(&'static str, &'static str)>,
}

/// Metadata placing a handler in the pipeline.
#[derive(Clone, Debug, Default)]
pub struct Descriptor {
    pub name: &'static str,
    pub requires: Vec<Anchor>,
    pub expects: Vec<Anchor>,
    pub handles: BTreeMap<&'static str, OpInfo>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate middleware name '{0}'")]
    DuplicateName(&'static str),
    #[error("middleware '{handler}' references {anchor}, which nothing in the stack provides")]
    Unresolved { handler: &'static str, anchor: String },
    #[error("op '{op}' is provided by both '{first}' and '{second}'")]
    AmbiguousOp {
        op: &'static str,
        first: &'static str,
        second: &'static str,
    },
    #[error("middleware dependency cycle involving '{0}'")]
    Cycle(&'static str),
}

/// One in-flight request: the message plus the channel it arrived on and
/// the session resolved for it (if any middleware has done so yet).
#[derive(Clone)]
pub struct Request {
    pub msg: Message,
    pub transport: Arc<dyn Transport>,
    pub session: Option<Arc<Session>>,
}

impl Request {
    pub fn new(msg: Message, transport: Arc<dyn Transport>) -> Request {
        Request {
            msg,
            transport,
            session: None,
        }
    }

    /// Send a response on this request's transport. Failures are logged and
    /// swallowed: a dead connection must not unwind a draining handler.
    pub fn send(&self, msg: &Message) {
        if let Err(err) = self.transport.send(msg) {
            tracing::debug!(error = %err, "response send failed");
        }
    }

    /// Derive a request with a replaced message, keeping channel + session.
    pub fn with_msg(&self, msg: Message) -> Request {
        Request {
            msg,
            transport: Arc::clone(&self.transport),
            session: self.session.clone(),
        }
    }

    pub fn with_transport(&self, transport: Arc<dyn Transport>) -> Request {
        Request {
            msg: self.msg.clone(),
            transport,
            session: self.session.clone(),
        }
    }

    pub fn with_session(&self, session: Arc<Session>) -> Request {
        Request {
            msg: self.msg.clone(),
            transport: Arc::clone(&self.transport),
            session: Some(session),
        }
    }
}

/// A handler in the pipeline. Responses are emitted on the request's
/// transport; messages an op does not claim must be passed through.
pub trait Middleware: Send + Sync {
    fn descriptor(&self) -> Descriptor;

    fn handle(&self, req: Request, next: Next<'_>);

    /// Called once after linearization with every descriptor in the stack.
    fn bind_stack(&self, _descriptors: &[Descriptor]) {}
}

/// The rest of the chain below the current handler.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub fn forward(self, req: Request) {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(req, Next { chain: rest }),
            None => unknown_op(&req),
        }
    }
}

/// Terminal handler: nothing claimed the op.
fn unknown_op(req: &Request) {
    let op = req.msg.op().unwrap_or_default().to_string();
    tracing::debug!(op, "no handler claimed op");
    req.send(
        &req.msg
            .reply()
            .with("op", op)
            .with_status(&["error", "unknown-op", "done"]),
    );
}

/// The linearized pipeline.
pub struct Stack {
    chain: Vec<Arc<dyn Middleware>>,
    descriptors: Vec<Descriptor>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

impl Stack {
    /// Topologically order the handlers by their descriptors. Ties break by
    /// insertion order so the result is stable across runs.
    pub fn linearize(handlers: Vec<Arc<dyn Middleware>>) -> Result<Stack, ConfigError> {
        let descriptors: Vec<Descriptor> =
            handlers.iter().map(|handler| handler.descriptor()).collect();

        let mut by_name: BTreeMap<&'static str, usize> = BTreeMap::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            if by_name.insert(descriptor.name, index).is_some() {
                return Err(ConfigError::DuplicateName(descriptor.name));
            }
        }

        let resolve = |anchor: &Anchor, handler: &'static str| -> Result<usize, ConfigError> {
            match anchor {
                Anchor::Handler(name) => {
                    by_name
                        .get(name)
                        .copied()
                        .ok_or_else(|| ConfigError::Unresolved {
                            handler,
                            anchor: anchor.label(),
                        })
                }
                Anchor::Op(op) => {
                    let mut found: Option<usize> = None;
                    for (index, descriptor) in descriptors.iter().enumerate() {
                        if descriptor.handles.contains_key(op) {
                            if let Some(first) = found {
                                return Err(ConfigError::AmbiguousOp {
                                    op,
                                    first: descriptors[first].name,
                                    second: descriptor.name,
                                });
                            }
                            found = Some(index);
                        }
                    }
                    found.ok_or_else(|| ConfigError::Unresolved {
                        handler,
                        anchor: anchor.label(),
                    })
                }
            }
        };

        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            for anchor in &descriptor.requires {
                let before = resolve(anchor, descriptor.name)?;
                if before != index {
                    edges.insert((before, index));
                }
            }
            for anchor in &descriptor.expects {
                let after = resolve(anchor, descriptor.name)?;
                if after != index {
                    edges.insert((index, after));
                }
            }
        }

        let mut indegree = vec![0usize; descriptors.len()];
        for (_, to) in &edges {
            indegree[*to] += 1;
        }

        // Kahn's algorithm; the ready set is ordered by insertion index.
        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(index, _)| index)
            .collect();
        let mut order = Vec::with_capacity(descriptors.len());
        while let Some(index) = ready.iter().next().copied() {
            ready.remove(&index);
            order.push(index);
            for (from, to) in &edges {
                if *from == index {
                    indegree[*to] -= 1;
                    if indegree[*to] == 0 {
                        ready.insert(*to);
                    }
                }
            }
        }
        if order.len() != descriptors.len() {
            let stuck = (0..descriptors.len())
                .find(|index| !order.contains(index))
                .expect("cycle implies a leftover node");
            return Err(ConfigError::Cycle(descriptors[stuck].name));
        }

        let chain: Vec<Arc<dyn Middleware>> = order
            .iter()
            .map(|index| Arc::clone(&handlers[*index]))
            .collect();
        for handler in &chain {
            handler.bind_stack(&descriptors);
        }
        Ok(Stack { chain, descriptors })
    }

    /// Run one message through the pipeline.
    pub fn handle(&self, msg: Message, transport: Arc<dyn Transport>) {
        self.dispatch(Request::new(msg, transport));
    }

    pub fn dispatch(&self, req: Request) {
        Next { chain: &self.chain }.forward(req);
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Handler names in pipeline order, outermost first.
    pub fn order(&self) -> Vec<&'static str> {
        self.chain
            .iter()
            .map(|handler| handler.descriptor().name)
            .collect()
    }
}

/// The standard pipeline: session lifecycle, stdin, load-file, describe,
/// value printing, interruptible evaluation, in linearized order.
pub fn default_stack(
    registry: Arc<crate::session::SessionRegistry>,
    pool: Arc<crate::eval::WorkerPool>,
    runtime: Arc<dyn crate::runtime::LanguageRuntime>,
) -> Result<Stack, ConfigError> {
    Stack::linearize(vec![
        Arc::new(crate::session::SessionMiddleware::new(registry)),
        Arc::new(crate::eval::InterruptibleEval::new(pool, runtime)),
        Arc::new(AddStdin::new()),
        Arc::new(LoadFile::new()),
        Arc::new(Describe::new()),
        Arc::new(PrValues::new()),
    ])
}
