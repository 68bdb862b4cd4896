use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::ConfigError;

/// Settings of a `Server` and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Number of worker processes, 0 runs a single worker in the calling process.
    pub worker_processes: usize,
    /// Size of the receive buffer each worker's event loop shares between connections.
    pub recv_buffer_size: usize,
    /// Time after which a cached file is checked again, also the sweep period.
    pub file_cache_ttl: Duration,
    pub document_root: PathBuf,
    /// Close connections that received nothing for this long, never if `None`.
    pub read_timeout: Option<Duration>,
    /// Name used in process titles.
    pub program_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            worker_processes: 0,
            recv_buffer_size: 4096,
            file_cache_ttl: Duration::from_secs(10),
            document_root: PathBuf::from("."),
            read_timeout: None,
            program_name: default_program_name(),
        }
    }
}

impl ServerConfig {
    /// Defaults, overridden by `KINDLING_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults, overridden by values `lookup` returns for `KINDLING_*` keys.
    ///
    /// Durations are given in whole seconds, a read timeout of 0 disables it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("KINDLING_LISTEN") {
            config.listen_addr = parse("KINDLING_LISTEN", value)?;
        }
        if let Some(value) = lookup("KINDLING_WORKERS") {
            config.worker_processes = parse("KINDLING_WORKERS", value)?;
        }
        if let Some(value) = lookup("KINDLING_ROOT") {
            config.document_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("KINDLING_CACHE_TTL") {
            config.file_cache_ttl = Duration::from_secs(parse("KINDLING_CACHE_TTL", value)?);
        }
        if let Some(value) = lookup("KINDLING_READ_TIMEOUT") {
            let seconds: u64 = parse("KINDLING_READ_TIMEOUT", value)?;
            config.read_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        }
        if let Some(value) = lookup("KINDLING_RECV_BUFSIZE") {
            let size: usize = parse("KINDLING_RECV_BUFSIZE", value.clone())?;
            if size == 0 {
                return Err(ConfigError {
                    key: "KINDLING_RECV_BUFSIZE",
                    value,
                    reason: "must be non-zero".to_string(),
                });
            }
            config.recv_buffer_size = size;
        }

        Ok(config)
    }

    /// Worker count after applying platform limits.
    ///
    /// Without process support more than one worker isn't possible.
    pub fn effective_worker_processes(&self) -> usize {
        if cfg!(unix) {
            self.worker_processes
        } else {
            self.worker_processes.min(1)
        }
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse() {
        Ok(parsed) => Ok(parsed),
        Err(error) => Err(ConfigError {
            key,
            reason: error.to_string(),
            value,
        }),
    }
}

fn default_program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(|path| path.file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "kindling".to_string())
}
