//! The `describe` op: aggregated op table and version report.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{Descriptor, Middleware, Next, OpInfo, Request};
use crate::message::Data;
use crate::{PROTOCOL_VERSION, VERSION};

#[derive(Default)]
pub struct Describe {
    descriptors: Mutex<Vec<Descriptor>>,
}

impl Describe {
    pub fn new() -> Describe {
        Describe::default()
    }

    fn ops_table(&self, verbose: bool) -> Data {
        let descriptors = self.descriptors.lock().expect("descriptor list poisoned");
        let mut ops = BTreeMap::new();
        for descriptor in descriptors.iter() {
            for (op, info) in &descriptor.handles {
                ops.insert(op.to_string(), op_entry(info, verbose));
            }
        }
        Data::Map(ops)
    }
}

fn op_entry(info: &OpInfo, verbose: bool) -> Data {
    if !verbose {
        return Data::Map(BTreeMap::new());
    }
    let arg_map = |args: &[(&str, &str)]| {
        Data::Map(
            args.iter()
                .map(|(name, doc)| (name.to_string(), Data::from(*doc)))
                .collect(),
        )
    };
    Data::Map(BTreeMap::from([
        ("doc".to_string(), Data::from(info.doc)),
        ("requires".to_string(), arg_map(&info.requires)),
        ("optional".to_string(), arg_map(&info.optional)),
        ("returns".to_string(), arg_map(&info.returns)),
    ]))
}

impl Middleware for Describe {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: "describe",
            requires: Vec::new(),
            expects: Vec::new(),
            handles: BTreeMap::from([(
                "describe",
                OpInfo {
                    doc: "Describe available ops and server versions.",
                    requires: vec![],
                    optional: vec![("verbose?", "Include op documentation.")],
                    returns: vec![
                        ("ops", "Map of op name to argument info."),
                        ("versions", "Server and protocol versions."),
                        ("aux", "Auxiliary server information."),
                    ],
                },
            )]),
        }
    }

    fn bind_stack(&self, descriptors: &[Descriptor]) {
        *self.descriptors.lock().expect("descriptor list poisoned") = descriptors.to_vec();
    }

    fn handle(&self, req: Request, next: Next<'_>) {
        if req.msg.op() != Some("describe") {
            next.forward(req);
            return;
        }
        let verbose = req.msg.contains("verbose?");
        let versions = Data::Map(BTreeMap::from([
            ("confab".to_string(), Data::from(VERSION)),
            ("protocol".to_string(), Data::from(PROTOCOL_VERSION)),
        ]));
        req.send(
            &req.msg
                .reply()
                .with("ops", self.ops_table(verbose))
                .with("versions", versions)
                .with("aux", Data::Map(BTreeMap::new()))
                .with_status(&["done"]),
        );
    }
}
