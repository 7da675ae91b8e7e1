//! Session lifecycle and isolation over the in-process rig.

use confab::message::{Data, Message};

use crate::fixtures::rig::{Rig, first_value};

fn listed_sessions(rig: &Rig, id: &str) -> Vec<String> {
    rig.send(Message::new().with("op", "ls-sessions").with("id", id));
    let msgs = rig.collect_done(id);
    let reply = msgs.last().unwrap();
    match reply.get("sessions") {
        Some(Data::List(items)) => items
            .iter()
            .filter_map(|item| match item {
                Data::Str(session) => Some(session.clone()),
                _ => None,
            })
            .collect(),
        other => panic!("expected a session list, got {other:?}"),
    }
}

#[test]
fn ls_sessions_tracks_clone_and_close() {
    let rig = Rig::start();
    let first = rig.clone_session();
    let second = rig.clone_session();

    let mut listed = listed_sessions(&rig, "ls1");
    listed.sort();
    let mut expected = vec![first.clone(), second.clone()];
    expected.sort();
    assert_eq!(listed, expected);

    rig.send(
        Message::new()
            .with("op", "close")
            .with("session", first.as_str())
            .with("id", "c1"),
    );
    let msgs = rig.collect_done("c1");
    let closed = msgs.last().unwrap();
    assert!(closed.has_status("done"));
    assert!(closed.has_status("session-closed"));

    assert_eq!(listed_sessions(&rig, "ls2"), vec![second]);
}

#[test]
fn closing_an_unknown_session_is_an_error() {
    let rig = Rig::start();
    rig.send(
        Message::new()
            .with("op", "close")
            .with("session", "no-such-session")
            .with("id", "c2"),
    );
    let reply = rig
        .collect_until(|msg| msg.has_status("unknown-session"))
        .pop()
        .unwrap();
    assert!(reply.has_status("error"));
}

#[test]
fn requests_against_a_dangling_session_are_rejected() {
    let rig = Rig::start();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("session", "no-such-session")
            .with("code", "(+ 1 1)")
            .with("id", "d1"),
    );
    let reply = rig
        .collect_until(|msg| msg.has_status("unknown-session"))
        .pop()
        .unwrap();
    assert!(reply.has_status("error"));
}

#[test]
fn cloned_sessions_are_isolated_from_their_parent() {
    let rig = Rig::start();
    let parent = rig.clone_session();
    rig.eval(&parent, "(def x 1)", "p1");
    rig.eval(&parent, "(+ 10 1)", "p2");

    // Clone from the parent: its bindings and result slots carry over.
    let child_req = format!("clone-{}", uuid::Uuid::new_v4());
    rig.send(
        Message::new()
            .with("op", "clone")
            .with("session", parent.as_str())
            .with("id", child_req.as_str()),
    );
    let child = rig
        .collect_done(&child_req)
        .iter()
        .find_map(|msg| msg.get_str("new-session").map(str::to_string))
        .expect("new-session");

    let inherited = rig.eval(&child, "(+ x *1)", "c1");
    assert_eq!(first_value(&inherited), Some("12"));

    // Mutations in the child stay in the child, and vice versa.
    rig.eval(&child, "(def x 100)", "c2");
    let parent_x = rig.eval(&parent, "x", "p3");
    assert_eq!(first_value(&parent_x), Some("1"));
    rig.eval(&parent, "(def x 2)", "p4");
    let child_x = rig.eval(&child, "x", "c3");
    assert_eq!(first_value(&child_x), Some("100"));
}

#[test]
fn requests_without_a_session_get_an_ephemeral_one() {
    let rig = Rig::start();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("code", "(+ 20 1)")
            .with("id", "eph1"),
    );
    let msgs = rig.collect_done("eph1");
    let value = msgs
        .iter()
        .find(|msg| msg.get_str("value").is_some())
        .expect("a value message");
    assert_eq!(value.get_str("value"), Some("21"));
    // The ephemeral session is never registered.
    assert_eq!(listed_sessions(&rig, "ls3"), Vec::<String>::new());
}

#[test]
fn close_during_an_eval_lets_it_drain() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("session", session.as_str())
            .with("code", "(+ 0 9) (sleep-ms 100) (+ 40 2)")
            .with("id", "drain"),
    );
    rig.collect_until(|msg| msg.get_str("value") == Some("9"));

    rig.send(
        Message::new()
            .with("op", "close")
            .with("session", session.as_str())
            .with("id", "c3"),
    );
    rig.collect_until(|msg| msg.id() == Some("c3") && msg.has_status("done"));

    // The in-flight eval still delivers its tail messages.
    let msgs = rig.collect_done("drain");
    assert!(msgs.iter().any(|msg| msg.get_str("value") == Some("42")));
}

#[test]
fn in_ns_persists_across_requests_in_a_session() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.eval(&session, "(in-ns (quote scratch))", "n1");
    let msgs = rig.eval(&session, "(+ 1 2)", "n2");
    let value = msgs
        .iter()
        .find(|msg| msg.get_str("value").is_some())
        .expect("a value message");
    assert_eq!(value.get_str("ns"), Some("scratch"));
}
