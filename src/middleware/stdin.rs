//! The `stdin` op: feed a session's standard-input mailbox.

use std::collections::BTreeMap;

use super::{Anchor, Descriptor, Middleware, Next, OpInfo, Request};

#[derive(Default)]
pub struct AddStdin;

impl AddStdin {
    pub fn new() -> AddStdin {
        AddStdin
    }
}

impl Middleware for AddStdin {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: "add-stdin",
            requires: vec![Anchor::Op("clone")],
            expects: vec![Anchor::Op("eval")],
            handles: BTreeMap::from([(
                "stdin",
                OpInfo {
                    doc: "Append input for the session's standard input.",
                    requires: vec![
                        ("stdin", "Text to append."),
                        ("session", "Session whose input to feed."),
                    ],
                    optional: vec![],
                    returns: vec![],
                },
            )]),
        }
    }

    fn handle(&self, req: Request, next: Next<'_>) {
        if req.msg.op() != Some("stdin") {
            next.forward(req);
            return;
        }
        let Some(session) = req.session.as_ref() else {
            req.send(&req.msg.reply().with_status(&["error", "unknown-session"]));
            return;
        };
        if let Some(text) = req.msg.get_str("stdin") {
            session.stdin().feed(text);
        }
        req.send(&req.msg.reply().with_status(&["done"]));
    }
}
