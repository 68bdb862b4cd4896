//! Master/worker HTTP server.
//!
//! A `Server` binds its listening socket once, then either runs a single worker in the calling
//! process or spawns workers that each run their own event loop on the shared socket. Every
//! worker owns its file cache, so nothing is shared between workers but the socket.

mod config;
mod error;
pub mod process;
mod server;
mod supervisor;
mod worker;

#[cfg(unix)]
pub use self::supervisor::ForkSpawner;
pub use self::{
    config::ServerConfig,
    error::{ConfigError, ServerError},
    server::{DefaultSpawner, Server},
    supervisor::{Spawner, Supervisor, ThreadSpawner, WorkerContext, WorkerEntry},
    worker::{add_cache_sweep, run_worker, setup_worker},
};
