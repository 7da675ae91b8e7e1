//! Server configuration: defaults, TOML file loading, environment
//! overrides.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read {path}: {detail}")]
    Read { path: String, detail: String },
    #[error("failed to parse {path}: {detail}")]
    Parse { path: String, detail: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the server binds, `host:port`; port 0 picks a free port.
    pub listen_addr: String,
    /// When set, announce the listening port to this local port on startup.
    pub ack_port: Option<u16>,
    /// Threads in the shared evaluation/dispatch pool.
    pub worker_threads: usize,
    /// Accepted connections beyond this are dropped with a warning.
    pub max_connections: usize,
    /// Upper bound on a single decoded wire message.
    pub max_message_bytes: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: "127.0.0.1:7888".to_string(),
            ack_port: None,
            worker_threads: 4,
            max_connections: 64,
            max_message_bytes: 8 * 1024 * 1024,
        }
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigFileError> {
    let contents = fs::read_to_string(path).map_err(|err| ConfigFileError::Read {
        path: path.display().to_string(),
        detail: err.to_string(),
    })?;
    parse(&contents, path)
}

fn parse(contents: &str, path: &Path) -> Result<Config, ConfigFileError> {
    toml::from_str(contents).map_err(|err| ConfigFileError::Parse {
        path: path.display().to_string(),
        detail: err.to_string(),
    })
}

/// Load the given file if any, falling back to defaults on absence or
/// error (errors are logged, not fatal).
pub fn load_or_default(path: Option<&Path>) -> Config {
    match path {
        None => Config::default(),
        Some(path) => match load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "config load failed, using defaults");
                Config::default()
            }
        },
    }
}

/// Environment variables win over the file: `CONFAB_LISTEN`,
/// `CONFAB_ACK_PORT`, `CONFAB_WORKERS`.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(listen) = std::env::var("CONFAB_LISTEN") {
        config.listen_addr = listen;
    }
    if let Ok(port) = std::env::var("CONFAB_ACK_PORT")
        && let Ok(port) = port.parse()
    {
        config.ack_port = Some(port);
    }
    if let Ok(workers) = std::env::var("CONFAB_WORKERS")
        && let Ok(workers) = workers.parse()
    {
        config.worker_threads = workers;
    }
}
