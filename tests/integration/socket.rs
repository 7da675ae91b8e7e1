//! Full-server checks over real TCP sockets, including the ack
//! sub-protocol.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use confab::bencode;
use confab::config::Config;
use confab::eval::WorkerPool;
use confab::message::{Data, Message};
use confab::middleware;
use confab::runtime::sexp::SexpRuntime;
use confab::server::{Server, ServerHandle};
use confab::session::SessionRegistry;
use confab::transport::{Received, SocketTransport, Transport};

const MAX: usize = 1 << 20;
const DEADLINE: Duration = Duration::from_secs(10);

fn start_server(ack_port: Option<u16>) -> ServerHandle {
    let registry = Arc::new(SessionRegistry::new());
    let pool = Arc::new(WorkerPool::new(4));
    let runtime = Arc::new(SexpRuntime::new());
    let stack = Arc::new(
        middleware::default_stack(registry, Arc::clone(&pool), runtime).expect("default stack"),
    );
    let config = Config {
        listen_addr: "127.0.0.1:0".to_string(),
        ack_port,
        ..Config::default()
    };
    Server::start(config, stack, pool).expect("server starts")
}

fn recv_message(transport: &Arc<SocketTransport>) -> Message {
    match transport.recv_timeout(DEADLINE).expect("transport healthy") {
        Some(Received::Message(msg)) => msg,
        other => panic!("expected a message, got {other:?}"),
    }
}

fn collect_done(transport: &Arc<SocketTransport>, id: &str) -> Vec<Message> {
    let mut seen = Vec::new();
    loop {
        let msg = recv_message(transport);
        let matched = msg.id() == Some(id) && msg.has_status("done");
        seen.push(msg);
        if matched {
            return seen;
        }
        assert!(seen.len() < 100, "no terminal message in {seen:?}");
    }
}

#[test]
fn clone_and_eval_roundtrip_over_tcp() {
    let handle = start_server(None);
    let client = SocketTransport::connect(handle.local_addr(), MAX).expect("connect");

    client
        .send(&Message::new().with("op", "clone").with("id", "c1"))
        .unwrap();
    let session = collect_done(&client, "c1")
        .iter()
        .find_map(|msg| msg.get_str("new-session").map(str::to_string))
        .expect("new-session");

    client
        .send(
            &Message::new()
                .with("op", "eval")
                .with("session", session.as_str())
                .with("code", "(+ 1 2)")
                .with("id", "i1"),
        )
        .unwrap();
    let msgs = collect_done(&client, "i1");
    let value = msgs
        .iter()
        .find(|msg| msg.get_str("value").is_some())
        .expect("a value message");
    assert_eq!(value.get_str("value"), Some("3"));
    assert_eq!(value.get_str("ns"), Some("user"));

    client.close();
    handle.shutdown();
}

#[test]
fn startup_ack_is_a_netstring_framed_bencode_dict() {
    let ack_listener = TcpListener::bind("127.0.0.1:0").expect("bind ack listener");
    let ack_port = ack_listener.local_addr().expect("ack addr").port();

    let handle = start_server(Some(ack_port));
    let (mut ack_stream, _) = ack_listener.accept().expect("ack connection");
    let payload = bencode::read_netstring(&mut ack_stream, MAX)
        .expect("well-framed ack")
        .expect("nonempty ack");
    let wire = bencode::decode(&payload).expect("bencoded ack");
    let msg = confab::message::from_wire(wire).expect("ack message");
    assert_eq!(msg.op(), Some("ack"));
    assert_eq!(msg.get_int("port"), Some(handle.local_addr().port() as i64));

    handle.shutdown();
}

#[test]
fn unencoded_binary_fields_survive_ingress() {
    let handle = start_server(None);
    let client = SocketTransport::connect(handle.local_addr(), MAX).expect("connect");

    let png_ish = Bytes::from_static(b"\x89PNG\x0d\x0a\x1a\x0a\x00\xff");
    client
        .send(
            &Message::new()
                .with("op", "no-such-op")
                .with("id", "b1")
                .with("data", png_ish)
                .with(
                    "-unencoded",
                    Data::List(vec![Data::from("data")]),
                ),
        )
        .unwrap();

    // The server decoded the binary payload without poisoning the
    // connection and still answers.
    let msgs = collect_done(&client, "b1");
    let reply = msgs.last().unwrap();
    assert!(reply.has_status("unknown-op"));

    client.close();
    handle.shutdown();
}

#[test]
fn shutdown_closes_open_connections() {
    let handle = start_server(None);
    let client = SocketTransport::connect(handle.local_addr(), MAX).expect("connect");
    client
        .send(&Message::new().with("op", "describe").with("id", "d1"))
        .unwrap();
    collect_done(&client, "d1");

    handle.shutdown();
    match client.recv_timeout(DEADLINE).expect("clean eof") {
        Some(Received::Eof) => {}
        other => panic!("expected EOF after shutdown, got {other:?}"),
    }
}
