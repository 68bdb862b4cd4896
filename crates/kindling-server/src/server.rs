use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use kindling_http::{Service, StaticFiles};
use tracing::{event, instrument, Level};

use crate::{
    process, run_worker, ServerConfig, ServerError, Spawner, Supervisor, ThreadSpawner,
    WorkerEntry,
};

#[cfg(unix)]
pub type DefaultSpawner = crate::ForkSpawner;
#[cfg(not(unix))]
pub type DefaultSpawner = ThreadSpawner;

/// An HTTP server: its configuration, service, listening socket and workers.
///
/// Serves files from the configured document root unless another service is set.
pub struct Server<S = DefaultSpawner> {
    config: ServerConfig,
    service: Arc<dyn Service>,
    supervisor: Supervisor<S>,
    local_addr: Option<SocketAddr>,
}

impl Server<DefaultSpawner> {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_spawner(config, DefaultSpawner::default())
    }
}

impl Server<ThreadSpawner> {
    /// Create a server running its workers as threads of this process.
    pub fn threaded(config: ServerConfig) -> Self {
        Self::with_spawner(config, ThreadSpawner::default())
    }
}

impl<S: Spawner> Server<S> {
    pub fn with_spawner(config: ServerConfig, spawner: S) -> Self {
        let service = Arc::new(StaticFiles::new(&config.document_root));
        let supervisor = Supervisor::new(spawner, config.program_name.clone());

        Self {
            config,
            service,
            supervisor,
            local_addr: None,
        }
    }

    /// Replace the service answering requests.
    pub fn service(mut self, service: impl Service) -> Self {
        self.service = Arc::new(service);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor<S> {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor<S> {
        &mut self.supervisor
    }

    /// Address the server listens on, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start serving.
    ///
    /// Without worker processes this runs the worker in the calling process and only returns
    /// when it stops. Otherwise workers are spawned, and with `wait` the calling process
    /// becomes their master until it's told to shut down.
    #[instrument("Server::run", skip_all)]
    pub fn run(&mut self, wait: bool) -> Result<(), ServerError> {
        if self.supervisor.is_configured() {
            return Err(ServerError::OverLimit);
        }

        let listener = self.bind()?;
        let count = self.config.effective_worker_processes();
        let entry = self.worker_entry(listener);

        if count == 0 {
            event!(Level::INFO, "running worker in process");
            return entry().map_err(|error| ServerError::Worker(error.into()));
        }

        self.supervisor.start(count, entry)?;

        if wait {
            process::master_init(self.supervisor.program());
            self.supervisor.wait()?;
        }

        Ok(())
    }

    /// Stop all workers.
    pub fn shutdown(&mut self) {
        self.supervisor.shutdown();
    }

    /// Wait up to `timeout` for stopped workers to exit, returns the ids reaped.
    pub fn join(&mut self, timeout: Duration) -> Result<Vec<u32>, ServerError> {
        self.supervisor.join(timeout)
    }

    fn bind(&mut self) -> Result<TcpListener, ServerError> {
        let addr = self.config.listen_addr;
        let bind_error = |source| ServerError::Bind { addr, source };

        let listener = TcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;

        let local_addr = listener.local_addr().map_err(bind_error)?;
        event!(Level::INFO, addr = %local_addr, "listening");
        self.local_addr = Some(local_addr);

        Ok(listener)
    }

    fn worker_entry(&self, listener: TcpListener) -> WorkerEntry {
        let listener = Arc::new(listener);
        let service = self.service.clone();
        let config = self.config.clone();
        let stop = self.supervisor.stop_handle();

        Arc::new(move || {
            let listener = listener
                .try_clone()
                .context("failed to share listener with worker")?;
            run_worker(listener, service.clone(), &config, stop.clone())
        })
    }
}
