use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Error};
use tracing::{event, instrument, Level};

use crate::{process, ServerError};

/// How often the master checks for exited workers and signals.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);
/// Workers exiting sooner than this after starting count as failed starts.
const MIN_UPTIME: Duration = Duration::from_secs(1);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Function a worker runs until it's done serving.
pub type WorkerEntry = Arc<dyn Fn() -> Result<(), Error> + Send + Sync>;

/// One worker slot of a `Supervisor`.
pub struct WorkerContext {
    pid: Option<u32>,
    init: fn(&str),
    entry: WorkerEntry,
    started: Option<Instant>,
    restart_at: Option<Instant>,
    failures: u32,
}

impl WorkerContext {
    pub fn new(init: fn(&str), entry: WorkerEntry) -> Self {
        Self {
            pid: None,
            init,
            entry,
            started: None,
            restart_at: None,
            failures: 0,
        }
    }

    /// Id of the running worker, `None` if it isn't running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Failed starts in a row, reset once a worker stays up.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn init(&self) -> fn(&str) {
        self.init
    }

    pub fn entry(&self) -> &WorkerEntry {
        &self.entry
    }

    /// Run init and entry in the current process, returns an exit code.
    pub fn run(&self, program: &str) -> i32 {
        (self.init)(program);
        serve(&self.entry)
    }
}

fn serve(entry: &WorkerEntry) -> i32 {
    match entry() {
        Ok(()) => 0,
        Err(error) => {
            event!(Level::ERROR, ?error, "worker failed");
            1
        }
    }
}

/// Starts, reaps and stops workers.
pub trait Spawner {
    /// Start a worker running `context`, returns its id.
    fn spawn(&mut self, context: &WorkerContext, program: &str) -> Result<u32, Error>;

    /// Id of a worker that exited since the last call, without blocking.
    fn reap(&mut self) -> Result<Option<u32>, Error>;

    /// Ask a worker to stop.
    fn terminate(&mut self, pid: u32) -> Result<(), Error>;
}

/// Runs each worker as a forked child process.
#[cfg(unix)]
#[derive(Default)]
pub struct ForkSpawner;

#[cfg(unix)]
impl Spawner for ForkSpawner {
    fn spawn(&mut self, context: &WorkerContext, program: &str) -> Result<u32, Error> {
        // SAFETY: The child only runs the worker and then exits without returning here
        let pid = unsafe { libc::fork() };

        match pid {
            -1 => Err(std::io::Error::last_os_error()).context("fork failed"),
            0 => {
                let code = context.run(program);
                // SAFETY: Exiting the child without running the parent's atexit handlers
                unsafe { libc::_exit(code) }
            }
            pid => Ok(pid as u32),
        }
    }

    fn reap(&mut self) -> Result<Option<u32>, Error> {
        let mut status = 0;
        // SAFETY: Status is a valid pointer for the duration of the call
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

        if pid > 0 {
            event!(Level::DEBUG, pid, status, "reaped worker");
            return Ok(Some(pid as u32));
        }
        if pid == 0 {
            return Ok(None);
        }

        let error = std::io::Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::ECHILD) | Some(libc::EINTR) => Ok(None),
            _ => Err(error).context("waitpid failed"),
        }
    }

    fn terminate(&mut self, pid: u32) -> Result<(), Error> {
        // SAFETY: Sending a signal has no memory safety requirements
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };

        if result != 0 {
            let error = std::io::Error::last_os_error();
            // Already gone
            if error.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(error).context("kill failed");
        }

        Ok(())
    }
}

/// Runs each worker on a thread of the current process.
///
/// Threads can't be killed, workers stop when the server's stop flag is set. Process-wide
/// init is skipped, threads share the title and signal handlers of their process.
#[derive(Default)]
pub struct ThreadSpawner {
    next_id: u32,
    threads: HashMap<u32, JoinHandle<()>>,
}

impl Spawner for ThreadSpawner {
    fn spawn(&mut self, context: &WorkerContext, program: &str) -> Result<u32, Error> {
        self.next_id += 1;
        let id = self.next_id;

        let entry = context.entry().clone();
        event!(Level::TRACE, id, program, "spawning worker thread");

        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                serve(&entry);
            })
            .context("failed to spawn worker thread")?;
        self.threads.insert(id, handle);

        Ok(id)
    }

    fn reap(&mut self) -> Result<Option<u32>, Error> {
        let finished = self
            .threads
            .iter()
            .find(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id);

        let Some(id) = finished else {
            return Ok(None);
        };

        if let Some(handle) = self.threads.remove(&id) {
            if handle.join().is_err() {
                event!(Level::ERROR, id, "worker thread panicked");
            }
        }

        Ok(Some(id))
    }

    fn terminate(&mut self, pid: u32) -> Result<(), Error> {
        event!(Level::TRACE, pid, "worker thread stops with the stop flag");
        Ok(())
    }
}

/// Owns the worker slots of a server, and restarts workers that exit.
///
/// A worker that exits soon after starting is restarted with a doubling delay, so one that
/// can't start doesn't make the master spawn in a tight loop.
pub struct Supervisor<S> {
    spawner: S,
    program: String,
    workers: Vec<WorkerContext>,
    stop: Arc<AtomicBool>,
}

impl<S: Spawner> Supervisor<S> {
    pub fn new(spawner: S, program: impl Into<String>) -> Self {
        Self {
            spawner,
            program: program.into(),
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `stop` as the flag that ends supervision and threaded workers.
    pub fn with_stop_handle(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    pub fn spawner_mut(&mut self) -> &mut S {
        &mut self.spawner
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Check if workers were started, only one set of workers is allowed.
    pub fn is_configured(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn workers(&self) -> &[WorkerContext] {
        &self.workers
    }

    /// Ids of the running workers.
    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().filter_map(|worker| worker.pid).collect()
    }

    /// Flag set when the supervisor shuts down, for workers sharing its memory.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Start `count` workers running `entry`.
    ///
    /// If any worker fails to spawn, the ones already running are stopped and the supervisor
    /// is left unconfigured.
    #[instrument("Supervisor::start", skip_all)]
    pub fn start(&mut self, count: usize, entry: WorkerEntry) -> Result<(), ServerError> {
        if self.is_configured() {
            return Err(ServerError::OverLimit);
        }

        self.workers = (0..count)
            .map(|_| WorkerContext::new(process::worker_init, entry.clone()))
            .collect();

        for slot in 0..self.workers.len() {
            if let Err(error) = self.spawn_slot(slot, Instant::now()) {
                event!(Level::ERROR, slot, "failed to start workers, stopping started ones");
                self.abort_start();
                return Err(error);
            }
        }

        event!(Level::INFO, count, "workers started");
        Ok(())
    }

    /// Supervise workers until a shutdown signal arrives, then stop and reap them.
    ///
    /// Workers that exit in the meantime are started again in the same slot.
    #[instrument("Supervisor::wait", skip_all)]
    pub fn wait(&mut self) -> Result<(), ServerError> {
        while !self.stop.load(Ordering::SeqCst) && !process::shutdown_requested() {
            let now = Instant::now();

            for _ in 0..self.workers.len() {
                let Some(pid) = self.spawner.reap().map_err(worker_error)? else {
                    break;
                };
                self.on_exited(pid, now);
            }

            self.restart_due(now);
            thread::sleep(SUPERVISE_INTERVAL);
        }

        self.shutdown();
        self.join(SHUTDOWN_TIMEOUT)?;

        Ok(())
    }

    /// Stop all workers.
    pub fn shutdown(&mut self) {
        event!(Level::INFO, "stopping workers");
        self.stop.store(true, Ordering::SeqCst);

        for worker in &self.workers {
            let Some(pid) = worker.pid else { continue };

            if let Err(error) = self.spawner.terminate(pid) {
                event!(Level::WARN, pid, ?error, "failed to stop worker");
            }
        }
    }

    /// Reap stopped workers until none is left running or `timeout` passes.
    ///
    /// Returns the ids of the workers reaped.
    pub fn join(&mut self, timeout: Duration) -> Result<Vec<u32>, ServerError> {
        let deadline = Instant::now() + timeout;
        let mut reaped = Vec::new();

        while self.workers.iter().any(|worker| worker.pid.is_some()) {
            let Some(pid) = self.spawner.reap().map_err(worker_error)? else {
                if Instant::now() >= deadline {
                    event!(Level::WARN, pids = ?self.pids(), "workers still running");
                    break;
                }
                thread::sleep(JOIN_POLL);
                continue;
            };

            if let Some(worker) = self.workers.iter_mut().find(|w| w.pid == Some(pid)) {
                worker.pid = None;
                reaped.push(pid);
            }
        }

        Ok(reaped)
    }

    fn abort_start(&mut self) {
        self.shutdown();
        if let Err(error) = self.join(SHUTDOWN_TIMEOUT) {
            event!(Level::WARN, ?error, "failed to reap workers");
        }

        self.workers.clear();
        self.stop.store(false, Ordering::SeqCst);
    }

    fn on_exited(&mut self, pid: u32, now: Instant) {
        let Some(slot) = self.workers.iter().position(|worker| worker.pid == Some(pid)) else {
            event!(Level::TRACE, pid, "reaped unknown child");
            return;
        };
        let worker = &mut self.workers[slot];

        let uptime = worker
            .started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        if uptime < MIN_UPTIME {
            worker.failures += 1;
        } else {
            worker.failures = 0;
        }

        let delay = restart_delay(worker.failures);
        worker.pid = None;
        worker.restart_at = Some(now + delay);

        event!(Level::WARN, pid, slot, ?delay, "worker exited, restarting");
    }

    fn restart_due(&mut self, now: Instant) {
        for slot in 0..self.workers.len() {
            let worker = &self.workers[slot];
            let due = worker.restart_at.map_or(false, |at| at <= now);
            if worker.pid.is_some() || !due {
                continue;
            }

            if let Err(error) = self.spawn_slot(slot, now) {
                let worker = &mut self.workers[slot];
                worker.failures += 1;
                let delay = restart_delay(worker.failures);
                worker.restart_at = Some(now + delay);

                event!(Level::WARN, slot, ?delay, ?error, "failed to restart worker");
            }
        }
    }

    fn spawn_slot(&mut self, slot: usize, now: Instant) -> Result<(), ServerError> {
        let worker = &mut self.workers[slot];

        let pid = self
            .spawner
            .spawn(worker, &self.program)
            .map_err(|error| ServerError::Spawn(error.into()))?;
        worker.pid = Some(pid);
        worker.started = Some(now);
        worker.restart_at = None;

        event!(Level::DEBUG, pid, slot, "worker spawned");
        Ok(())
    }
}

fn worker_error(error: Error) -> ServerError {
    ServerError::Worker(error.into())
}

/// Delay before restarting a worker after `failures` failed starts in a row.
fn restart_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    let factor = 1u32 << (failures - 1).min(16);
    SUPERVISE_INTERVAL
        .saturating_mul(factor)
        .min(MAX_RESTART_DELAY)
}
