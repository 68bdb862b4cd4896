use std::{
    collections::HashMap,
    io::ErrorKind,
    mem,
    time::{Duration, Instant},
};

use anyhow::{ensure, Error};
use mio::{Events, Poll, Token};
use thunderdome::{Arena, Index};
use tracing::{event, instrument, Level};

use crate::{
    io::IoEntry,
    timer::{IdleEntry, TimerEntry},
};

/// Upper bound on a single poll, keeps timers and idle tasks responsive.
const MAX_BLOCK_TIME: Duration = Duration::from_millis(100);

/// Reactor dispatching socket readiness, timers and idle tasks to callbacks.
///
/// Callbacks receive the loop itself, and can register, write to, or close any io while they
/// run. The loop and its callbacks are not `Send`, an event loop stays on the thread that
/// created it.
pub struct EventLoop {
    pub(crate) poll: Poll,
    events: Events,
    next_token: usize,
    pub(crate) tokens: HashMap<Token, Index>,
    pub(crate) ios: Arena<IoEntry>,
    pub(crate) timers: Arena<TimerEntry>,
    pub(crate) idles: Arena<IdleEntry>,

    /// Receive buffer shared by every stream on this loop.
    ///
    /// Only valid for the duration of one read callback.
    pub(crate) read_buffer: Vec<u8>,
    /// Scratch buffer for ready events.
    ready: Vec<Ready>,
    stopped: bool,
}

#[derive(Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

impl EventLoop {
    /// Create a new event loop, with a shared receive buffer of `read_buffer_size` bytes.
    pub fn new(read_buffer_size: usize) -> Result<Self, Error> {
        ensure!(read_buffer_size > 0, "read buffer size must be non-zero");

        let value = Self {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            next_token: 0,
            tokens: HashMap::new(),
            ios: Arena::new(),
            timers: Arena::new(),
            idles: Arena::new(),

            read_buffer: vec![0; read_buffer_size],
            ready: Vec::new(),
            stopped: false,
        };
        Ok(value)
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer.len()
    }

    /// Number of listeners and streams currently registered.
    pub fn io_count(&self) -> usize {
        self.ios.len()
    }

    /// Make `run` return after the current iteration.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Run the loop until `stop` is called.
    #[instrument("EventLoop::run", skip_all)]
    pub fn run(&mut self) -> Result<(), Error> {
        event!(Level::DEBUG, "running event loop");

        while !self.stopped {
            self.run_once(None)?;
        }

        event!(Level::DEBUG, "event loop stopped");
        Ok(())
    }

    /// Run a single iteration: poll, dispatch io, fire due timers, and run idle tasks if
    /// nothing else happened.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = self.poll_timeout(timeout);

        if let Err(error) = self.poll.poll(&mut self.events, Some(timeout)) {
            if error.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(error.into());
        }

        // Events can't stay borrowed while callbacks get the loop
        let mut ready = mem::take(&mut self.ready);
        ready.extend(self.events.iter().map(|event| Ready {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable(),
        }));

        let active = !ready.is_empty();
        for ready in ready.drain(..) {
            self.dispatch(ready);
        }
        self.ready = ready;

        let now = Instant::now();
        let fired = self.fire_timers(now);
        self.expire_streams(now);

        if !active && fired == 0 {
            self.run_idles();
        }

        Ok(())
    }

    fn poll_timeout(&self, timeout: Option<Duration>) -> Duration {
        let mut timeout = timeout.unwrap_or(MAX_BLOCK_TIME).min(MAX_BLOCK_TIME);

        if let Some(deadline) = self.next_deadline() {
            let until = deadline.saturating_duration_since(Instant::now());
            timeout = timeout.min(until);
        }

        timeout
    }

    fn dispatch(&mut self, ready: Ready) {
        let Some(index) = self.tokens.get(&ready.token).copied() else {
            event!(Level::TRACE, "ready event for unregistered token");
            return;
        };

        if ready.readable {
            self.on_readable(index);
        }

        if ready.writable {
            self.on_writable(index);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if self.ios.len() != 0 {
            event!(
                Level::DEBUG,
                count = self.ios.len(),
                "event loop dropped with open io"
            );
        }
    }
}
