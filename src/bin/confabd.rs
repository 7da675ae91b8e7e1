//! The confab daemon: a Bencode-framed network REPL server over the
//! embedded s-expression runtime.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use confab::config::{self, Config};
use confab::eval::WorkerPool;
use confab::middleware;
use confab::runtime::sexp::SexpRuntime;
use confab::server::Server;
use confab::session::SessionRegistry;
use confab::telemetry;

#[derive(Parser)]
#[command(name = "confabd", version, about = "Bencode-framed network REPL server")]
struct Cli {
    /// Address to listen on, host:port (port 0 picks a free port).
    #[arg(long)]
    listen: Option<String>,

    /// Local port to announce the listening port to on startup.
    #[arg(long)]
    ack_port: Option<u16>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let mut config = config::load_or_default(cli.config.as_deref());
    config::apply_env_overrides(&mut config);
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(ack_port) = cli.ack_port {
        config.ack_port = Some(ack_port);
    }

    if let Err(err) = run(config) {
        tracing::error!(error = %err, "server failed");
        std::process::exit(1);
    }
}

fn run(config: Config) -> confab::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let pool = Arc::new(WorkerPool::new(config.worker_threads));
    let runtime = Arc::new(SexpRuntime::new());
    let stack = Arc::new(middleware::default_stack(
        registry,
        Arc::clone(&pool),
        runtime,
    )?);
    let handle = Server::start(config, stack, pool)?;
    tracing::info!(addr = %handle.local_addr(), "confabd listening");
    handle.join();
    Ok(())
}
