//! Protocol surface: describe, unknown ops, and status shapes.

use confab::message::{Data, Message};

use crate::fixtures::rig::Rig;

#[test]
fn describe_lists_every_built_in_op() {
    let rig = Rig::start();
    rig.send(Message::new().with("op", "describe").with("id", "d1"));
    let msgs = rig.collect_done("d1");
    let reply = msgs.last().unwrap();

    let Some(Data::Map(ops)) = reply.get("ops") else {
        panic!("describe responds with an ops map");
    };
    for op in [
        "clone",
        "close",
        "ls-sessions",
        "describe",
        "eval",
        "interrupt",
        "stdin",
        "load-file",
    ] {
        assert!(ops.contains_key(op), "describe is missing op {op}");
    }

    let Some(Data::Map(versions)) = reply.get("versions") else {
        panic!("describe responds with versions");
    };
    assert!(versions.contains_key("confab"));
    assert!(versions.contains_key("protocol"));
    assert!(matches!(reply.get("aux"), Some(Data::Map(_))));
}

#[test]
fn verbose_describe_includes_docs() {
    let rig = Rig::start();
    rig.send(
        Message::new()
            .with("op", "describe")
            .with("verbose?", "true")
            .with("id", "d2"),
    );
    let msgs = rig.collect_done("d2");
    let reply = msgs.last().unwrap();
    let Some(Data::Map(ops)) = reply.get("ops") else {
        panic!("describe responds with an ops map");
    };
    let Some(Data::Map(eval_info)) = ops.get("eval") else {
        panic!("eval entry present");
    };
    assert!(matches!(eval_info.get("doc"), Some(Data::Str(_))));
    assert!(matches!(eval_info.get("requires"), Some(Data::Map(_))));
}

#[test]
fn unknown_ops_fall_through_to_the_terminal_handler() {
    let rig = Rig::start();
    rig.send(Message::new().with("op", "teleport").with("id", "u1"));
    let msgs = rig.collect_done("u1");
    let reply = msgs.last().unwrap();
    assert!(reply.has_status("error"));
    assert!(reply.has_status("unknown-op"));
    assert_eq!(reply.get_str("op"), Some("teleport"));
}

#[test]
fn responses_carry_the_request_correlation_id() {
    let rig = Rig::start();
    let session = rig.clone_session();
    let msgs = rig.eval(&session, "(+ 2 2)", "corr-1");
    for msg in &msgs {
        assert_eq!(msg.id(), Some("corr-1"));
        assert_eq!(msg.session_id(), Some(session.as_str()));
    }
}
