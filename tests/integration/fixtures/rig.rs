//! In-process server rig: the default middleware stack over one end of a
//! paired transport, pumped the way the TCP server pumps a connection.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use confab::eval::WorkerPool;
use confab::message::Message;
use confab::middleware;
use confab::runtime::sexp::SexpRuntime;
use confab::session::SessionRegistry;
use confab::transport::{PairTransport, Received, Transport, pair};

const RECV_DEADLINE: Duration = Duration::from_secs(10);
const COLLECT_CAP: usize = 200;

pub struct Rig {
    pub client: Arc<PairTransport>,
    pub registry: Arc<SessionRegistry>,
    pool: Arc<WorkerPool>,
    pump: Option<JoinHandle<()>>,
}

impl Rig {
    pub fn start() -> Rig {
        Rig::with_workers(4)
    }

    /// A rig whose pool has exactly `workers` threads; one worker makes
    /// admission order deterministic for ordering tests.
    pub fn with_workers(workers: usize) -> Rig {
        let registry = Arc::new(SessionRegistry::new());
        let pool = Arc::new(WorkerPool::new(workers));
        let runtime = Arc::new(SexpRuntime::new());
        let stack = Arc::new(
            middleware::default_stack(
                Arc::clone(&registry),
                Arc::clone(&pool),
                runtime,
            )
            .expect("default stack linearizes"),
        );

        let (client, server) = pair();
        let server: Arc<dyn Transport> = server;
        let pump_pool = Arc::clone(&pool);
        let pump = std::thread::spawn(move || {
            loop {
                match server.recv() {
                    Ok(Received::Message(msg)) => {
                        let stack = Arc::clone(&stack);
                        let transport = Arc::clone(&server);
                        pump_pool.spawn(move || stack.handle(msg, transport));
                    }
                    _ => break,
                }
            }
        });

        Rig {
            client,
            registry,
            pool,
            pump: Some(pump),
        }
    }

    pub fn send(&self, msg: Message) {
        self.client.send(&msg).expect("rig send");
    }

    pub fn recv(&self) -> Message {
        match self
            .client
            .recv_timeout(RECV_DEADLINE)
            .expect("rig transport")
        {
            Some(Received::Message(msg)) => msg,
            Some(Received::Eof) => panic!("unexpected EOF from rig"),
            None => panic!("timed out waiting for a response"),
        }
    }

    /// Receive until `stop` matches; returns everything received, the
    /// matching message last.
    pub fn collect_until(&self, stop: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let msg = self.recv();
            let matched = stop(&msg);
            seen.push(msg);
            if matched {
                return seen;
            }
            assert!(seen.len() < COLLECT_CAP, "no terminal message in {seen:?}");
        }
    }

    /// Receive until the `done`-tagged response for the given request id.
    pub fn collect_done(&self, id: &str) -> Vec<Message> {
        self.collect_until(|msg| msg.id() == Some(id) && msg.has_status("done"))
    }

    pub fn clone_session(&self) -> String {
        let id = format!("clone-{}", uuid::Uuid::new_v4());
        self.send(Message::new().with("op", "clone").with("id", id.as_str()));
        let msgs = self.collect_done(&id);
        msgs.iter()
            .find_map(|msg| msg.get_str("new-session").map(str::to_string))
            .expect("clone responds with new-session")
    }

    /// Submit an eval and return everything up to its done.
    pub fn eval(&self, session: &str, code: &str, id: &str) -> Vec<Message> {
        self.send(
            Message::new()
                .with("op", "eval")
                .with("session", session)
                .with("code", code)
                .with("id", id),
        );
        self.collect_done(id)
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.client.close();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        self.pool.shutdown();
    }
}

/// First `value` slot rendered by pr-values in a response batch.
pub fn first_value(msgs: &[Message]) -> Option<&str> {
    msgs.iter().find_map(|msg| msg.get_str("value"))
}

/// All `value` slots in arrival order.
pub fn values(msgs: &[Message]) -> Vec<&str> {
    msgs.iter().filter_map(|msg| msg.get_str("value")).collect()
}
