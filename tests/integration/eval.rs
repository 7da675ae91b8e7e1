//! End-to-end evaluation behavior over the in-process rig.

use confab::message::Message;

use crate::fixtures::rig::{Rig, first_value, values};

#[test]
fn simple_eval_streams_value_then_done() {
    let rig = Rig::start();
    let session = rig.clone_session();
    let msgs = rig.eval(&session, "(+ 1 2)", "i1");

    let value = msgs
        .iter()
        .find(|msg| msg.get_str("value").is_some())
        .expect("a value message");
    assert_eq!(value.get_str("value"), Some("3"));
    assert_eq!(value.get_str("ns"), Some("user"));
    assert_eq!(value.id(), Some("i1"));
    assert_eq!(value.session_id(), Some(session.as_str()));

    let done = msgs.last().expect("nonempty");
    assert!(done.has_status("done"));
    assert_eq!(done.id(), Some("i1"));
    assert_eq!(done.session_id(), Some(session.as_str()));
}

#[test]
fn each_form_produces_a_value_and_slots_rotate() {
    let rig = Rig::start();
    let session = rig.clone_session();
    let msgs = rig.eval(&session, "(+ 1 1) (+ 2 2) (+ *1 *2)", "i2");
    assert_eq!(values(&msgs), vec!["2", "4", "6"]);
}

#[test]
fn stdout_is_streamed_and_tagged_with_the_request() {
    let rig = Rig::start();
    let session = rig.clone_session();
    let msgs = rig.eval(&session, "(println \"hi\")", "p1");

    let out = msgs
        .iter()
        .find(|msg| msg.get_str("out").is_some())
        .expect("an out message");
    assert_eq!(out.get_str("out"), Some("hi\n"));
    assert_eq!(out.id(), Some("p1"));
    assert_eq!(out.session_id(), Some(session.as_str()));

    let out_at = msgs
        .iter()
        .position(|msg| msg.get_str("out").is_some())
        .unwrap();
    let value_at = msgs
        .iter()
        .position(|msg| msg.get_str("value").is_some())
        .unwrap();
    assert!(out_at < value_at, "output flushes before the form's value");
}

#[test]
fn eval_error_reports_ex_and_diagnostic_then_done() {
    let rig = Rig::start();
    let session = rig.clone_session();
    let msgs = rig.eval(&session, "(no-such-fn 1)", "e1");

    let failure = msgs
        .iter()
        .find(|msg| msg.has_status("eval-error"))
        .expect("an eval-error message");
    assert_eq!(failure.get_str("ex"), Some("UndefinedSymbol"));
    assert_eq!(failure.get_str("root-ex"), Some("UndefinedSymbol"));

    let diagnostic = msgs
        .iter()
        .find(|msg| msg.get_str("err").is_some())
        .expect("a diagnostic on the error stream");
    assert!(
        diagnostic
            .get_str("err")
            .unwrap()
            .contains("unable to resolve symbol")
    );
    assert!(msgs.last().unwrap().has_status("done"));
}

#[test]
fn eval_error_is_recorded_in_the_error_slot() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.eval(&session, "(no-such-fn)", "e2");
    let msgs = rig.eval(&session, "*e", "e3");
    let recorded = first_value(&msgs).expect("a value");
    assert!(recorded.contains("unable to resolve symbol"));
}

#[test]
fn eval_without_code_reports_no_code() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("session", session.as_str())
            .with("id", "n1"),
    );
    let msgs = rig.collect_done("n1");
    let done = msgs.last().unwrap();
    assert!(done.has_status("error"));
    assert!(done.has_status("no-code"));
}

#[test]
fn eval_in_a_missing_namespace_is_rejected() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("session", session.as_str())
            .with("code", "(+ 1 2)")
            .with("ns", "no-such-ns")
            .with("id", "ns1"),
    );
    let msgs = rig.collect_done("ns1");
    let done = msgs.last().unwrap();
    assert!(done.has_status("error"));
    assert!(done.has_status("namespace-not-found"));
}

#[test]
fn stdin_roundtrip_announces_need_input() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("session", session.as_str())
            .with("code", "(read-line)")
            .with("id", "r1"),
    );

    let announcement = rig.collect_until(|msg| msg.has_status("need-input"));
    let need_input = announcement.last().unwrap();
    assert_eq!(need_input.session_id(), Some(session.as_str()));

    rig.send(
        Message::new()
            .with("op", "stdin")
            .with("session", session.as_str())
            .with("stdin", "hello\n")
            .with("id", "s1"),
    );

    let msgs = rig.collect_done("r1");
    assert_eq!(first_value(&msgs), Some("\"hello\""));
}

#[test]
fn interrupt_cancels_a_running_loop_in_order() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("session", session.as_str())
            .with("code", "(+ 0 1) (loop [] (recur))")
            .with("id", "L"),
    );
    // The first form's value proves the eval is running before we shoot.
    rig.collect_until(|msg| msg.get_str("value") == Some("1"));

    rig.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("interrupt-id", "L")
            .with("id", "K"),
    );

    // The interrupt ack and the eval's done race on separate threads;
    // wait for both before asserting on ordering.
    let eval_done = std::cell::Cell::new(false);
    let interrupt_done = std::cell::Cell::new(false);
    let msgs = rig.collect_until(|msg| {
        if msg.has_status("done") {
            match msg.id() {
                Some("L") => eval_done.set(true),
                Some("K") => interrupt_done.set(true),
                _ => {}
            }
        }
        eval_done.get() && interrupt_done.get()
    });
    let interrupted_at = msgs
        .iter()
        .position(|msg| msg.has_status("interrupted") && msg.id() == Some("L"))
        .expect("interrupted tag for the eval");
    let eval_done_at = msgs
        .iter()
        .position(|msg| msg.id() == Some("L") && msg.has_status("done"))
        .expect("the eval's done");
    assert!(
        interrupted_at < eval_done_at,
        "interrupted precedes the eval's done"
    );
    // An interrupted eval does not rotate the result slots.
    let probe = rig.eval(&session, "*1", "after");
    assert_eq!(first_value(&probe), Some("1"));
}

#[test]
fn interrupt_on_an_idle_session_reports_session_idle() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("id", "k1"),
    );
    let msgs = rig.collect_done("k1");
    assert!(msgs.last().unwrap().has_status("session-idle"));
}

#[test]
fn interrupt_with_a_stale_id_is_a_mismatch() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "eval")
            .with("session", session.as_str())
            .with("code", "(+ 0 7) (sleep-ms 1500)")
            .with("id", "slow"),
    );
    rig.collect_until(|msg| msg.get_str("value") == Some("7"));

    rig.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("interrupt-id", "not-slow")
            .with("id", "m1"),
    );
    let msgs = rig.collect_done("m1");
    let done = msgs.last().unwrap();
    assert!(done.has_status("error"));
    assert!(done.has_status("interrupt-id-mismatch"));

    // Clean up the sleeper so the rig can drain quickly.
    rig.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("interrupt-id", "slow")
            .with("id", "m2"),
    );
    rig.collect_done("slow");
}

#[test]
fn queued_evals_complete_in_admission_order() {
    let rig = Rig::with_workers(1);
    let session = rig.clone_session();
    for n in 0..4 {
        rig.send(
            Message::new()
                .with("op", "eval")
                .with("session", session.as_str())
                .with("code", "(sleep-ms 15)")
                .with("id", format!("fifo-{n}")),
        );
    }
    let msgs = rig.collect_done("fifo-3");
    let done_order: Vec<&str> = msgs
        .iter()
        .filter(|msg| msg.has_status("done"))
        .filter_map(|msg| msg.id())
        .collect();
    assert_eq!(done_order, vec!["fifo-0", "fifo-1", "fifo-2", "fifo-3"]);
}

#[test]
fn load_file_evaluates_the_whole_body() {
    let rig = Rig::start();
    let session = rig.clone_session();
    rig.send(
        Message::new()
            .with("op", "load-file")
            .with("session", session.as_str())
            .with("file", "(def seed 5) (+ seed 1)")
            .with("file-name", "seed.clj")
            .with("id", "f1"),
    );
    let msgs = rig.collect_done("f1");
    assert_eq!(values(&msgs).last(), Some(&"6"));

    // Definitions from the file persist in the session.
    let probe = rig.eval(&session, "seed", "f2");
    assert_eq!(first_value(&probe), Some("5"));
}
