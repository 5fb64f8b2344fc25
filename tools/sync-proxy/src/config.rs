//! Proxy configuration file.
//!
//! ```toml
//! [worker]
//! origin = "http://localhost:3000"
//! cache_version = "v2"
//!
//! [proxy]
//! listen = "127.0.0.1:8787"
//! workers = 8
//! store = "/var/lib/sync-proxy/queue.json"
//! upstream = "http://10.0.0.5:3000"
//! ```
//!
//! Every field is optional.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sync_worker::WorkerConfig;

use crate::error::ProxyError;

fn default_listen() -> String {
    String::from("127.0.0.1:8787")
}

fn default_workers() -> usize {
    8
}

fn default_store() -> PathBuf {
    PathBuf::from("sync-queue.json")
}

/// The `[proxy]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Threads handling requests. Further connections wait in the listener.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Path of the queue ledger file.
    #[serde(default = "default_store")]
    pub store: PathBuf,
    /// Origin requests are forwarded to. Replaces `worker.origin` when set.
    #[serde(default)]
    pub upstream: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            store: default_store(),
            upstream: None,
        }
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl ProxyConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ProxyError> {
        let mut config: Self = toml::from_str(content)?;
        config.resolve()?;
        Ok(config)
    }

    /// Load from `path`, or use the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ProxyError> {
        let Some(path) = path else {
            let mut config = Self::default();
            config.resolve()?;
            return Ok(config);
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProxyError::ConfigNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ProxyError::Io(e)
            }
        })?;
        Self::from_toml_str(&content)
    }

    fn resolve(&mut self) -> Result<(), ProxyError> {
        if let Some(upstream) = &self.proxy.upstream {
            self.worker.origin = upstream.clone();
        }
        self.worker.validate()?;
        self.listen_addr()?;
        if self.proxy.workers == 0 {
            return Err(ProxyError::InvalidConfig(String::from(
                "proxy.workers must be positive",
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        self.proxy.listen.parse().map_err(|e| {
            ProxyError::InvalidConfig(format!("invalid listen address {}: {}", self.proxy.listen, e))
        })
    }
}
