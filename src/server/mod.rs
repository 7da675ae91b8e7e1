//! TCP accept loop and per-connection message pumps.
//!
//! Each accepted connection gets a socket transport and a pump thread; every
//! received message is dispatched to the shared worker pool. A protocol
//! error tears that connection down and leaves the server running. On
//! startup the server optionally announces itself to an ack port.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::bencode;
use crate::config::Config;
use crate::eval::WorkerPool;
use crate::message::{self, Message};
use crate::middleware::Stack;
use crate::transport::{Received, SocketTransport, Transport};

const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Transports for connections currently being pumped.
#[derive(Default)]
struct ConnectionSet {
    open: Mutex<HashMap<u64, Arc<dyn Transport>>>,
    next_id: AtomicU64,
}

impl ConnectionSet {
    fn add(&self, transport: Arc<dyn Transport>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open
            .lock()
            .expect("connection set lock poisoned")
            .insert(id, transport);
        id
    }

    fn remove(&self, id: u64) {
        self.open
            .lock()
            .expect("connection set lock poisoned")
            .remove(&id);
    }

    fn len(&self) -> usize {
        self.open.lock().expect("connection set lock poisoned").len()
    }

    fn close_all(&self) {
        let open: Vec<Arc<dyn Transport>> = self
            .open
            .lock()
            .expect("connection set lock poisoned")
            .values()
            .cloned()
            .collect();
        for transport in open {
            transport.close();
        }
    }
}

pub struct Server;

pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
    connections: Arc<ConnectionSet>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every open connection, and wait for the
    /// accept loop to exit. Draining evaluations finish on the pool; their
    /// sends fail silently.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.connections.close_all();
        let _ = self.join.join();
    }

    /// Block until the accept loop exits.
    pub fn join(self) {
        let _ = self.join.join();
    }
}

struct ServerRuntime {
    stack: Arc<Stack>,
    pool: Arc<WorkerPool>,
    connections: Arc<ConnectionSet>,
    shutdown: Arc<AtomicBool>,
    max_connections: usize,
    max_message_bytes: usize,
}

impl Server {
    pub fn start(
        config: Config,
        stack: Arc<Stack>,
        pool: Arc<WorkerPool>,
    ) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        let local_addr = listener.local_addr()?;

        if let Some(ack_port) = config.ack_port {
            match send_ack(ack_port, local_addr.port()) {
                Ok(()) => tracing::debug!(ack_port, "startup ack sent"),
                Err(err) => tracing::warn!(ack_port, error = %err, "startup ack failed"),
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(ConnectionSet::default());
        let runtime = ServerRuntime {
            stack,
            pool,
            connections: Arc::clone(&connections),
            shutdown: Arc::clone(&shutdown),
            max_connections: config.max_connections,
            max_message_bytes: config.max_message_bytes,
        };
        let join = thread::spawn(move || run_accept_loop(listener, runtime));

        Ok(ServerHandle {
            shutdown,
            join,
            local_addr,
            connections,
        })
    }
}

fn run_accept_loop(listener: TcpListener, runtime: ServerRuntime) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!(error = %err, "failed to set listener nonblocking");
        return;
    }

    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                if runtime.connections.len() >= runtime.max_connections {
                    tracing::warn!(%peer, "connection limit reached; dropping");
                    continue;
                }
                match SocketTransport::start(stream, runtime.max_message_bytes) {
                    Ok(transport) => {
                        let transport: Arc<dyn Transport> = transport;
                        let id = runtime.connections.add(Arc::clone(&transport));
                        tracing::debug!(%peer, connection = id, "connection accepted");
                        let stack = Arc::clone(&runtime.stack);
                        let pool = Arc::clone(&runtime.pool);
                        let connections = Arc::clone(&runtime.connections);
                        thread::spawn(move || {
                            run_connection_pump(id, transport, stack, pool, connections);
                        });
                    }
                    Err(err) => tracing::warn!(%peer, error = %err, "transport setup failed"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept error");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Receive loop for one connection: every message goes to the worker pool;
/// EOF or a protocol error ends the loop and drops the connection from the
/// open set.
fn run_connection_pump(
    id: u64,
    transport: Arc<dyn Transport>,
    stack: Arc<Stack>,
    pool: Arc<WorkerPool>,
    connections: Arc<ConnectionSet>,
) {
    loop {
        match transport.recv() {
            Ok(Received::Message(msg)) => {
                let stack = Arc::clone(&stack);
                let transport = Arc::clone(&transport);
                pool.spawn(move || stack.handle(msg, transport));
            }
            Ok(Received::Eof) => {
                tracing::debug!(connection = id, "connection closed");
                break;
            }
            Err(err) => {
                tracing::warn!(connection = id, error = %err, "connection torn down");
                break;
            }
        }
    }
    connections.remove(id);
    transport.close();
}

/// Announce the listening port to tooling that asked for it: one netstring
/// whose payload is the bencoded `{op: "ack", port}` dictionary.
fn send_ack(ack_port: u16, listening_port: u16) -> io::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", ack_port))?;
    let msg = Message::new()
        .with("op", "ack")
        .with("port", listening_port as i64);
    let wire = message::to_wire(&msg).expect("ack message carries wire types only");
    bencode::encode_netstring(&bencode::encode(&wire), &mut stream)?;
    stream.flush()
}
