//! The `load-file` op: rewrite a file body into an `eval` request.

use std::collections::BTreeMap;

use super::{Anchor, Descriptor, Middleware, Next, OpInfo, Request};

#[derive(Default)]
pub struct LoadFile;

impl LoadFile {
    pub fn new() -> LoadFile {
        LoadFile
    }
}

impl Middleware for LoadFile {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: "load-file",
            requires: Vec::new(),
            expects: vec![Anchor::Op("eval")],
            handles: BTreeMap::from([(
                "load-file",
                OpInfo {
                    doc: "Evaluate a whole file body in the session.",
                    requires: vec![("file", "Full source text of the file.")],
                    optional: vec![
                        ("file-name", "Name of the source file."),
                        ("file-path", "Path of the source file."),
                    ],
                    returns: vec![("value", "As for eval.")],
                },
            )]),
        }
    }

    fn handle(&self, req: Request, next: Next<'_>) {
        if req.msg.op() != Some("load-file") {
            next.forward(req);
            return;
        }
        let Some(file) = req.msg.get_str("file") else {
            req.send(&req.msg.reply().with_status(&["error", "no-code", "done"]));
            return;
        };
        // Rewrite downward as an eval; file-name/file-path stay attached
        // for diagnostics.
        let mut derived = req.msg.clone();
        derived.insert("op", "eval");
        derived.insert("code", file.to_string());
        derived.remove("file");
        next.forward(req.with_msg(derived));
    }
}
