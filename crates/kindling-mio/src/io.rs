use std::{
    io::{ErrorKind, Read, Write},
    mem,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::Error;
use mio::{
    net::{TcpListener, TcpStream},
    Interest, Registry, Token,
};
use thiserror::Error;
use thunderdome::Index;
use tracing::{event, instrument, Level};

use crate::{check_io, EventLoop};

type AcceptCallback = Box<dyn FnMut(&mut EventLoop, TcpStream, SocketAddr) -> Result<(), Error>>;
type ReadCallback = Box<dyn FnMut(&mut EventLoop, IoId, &[u8])>;
type CloseCallback = Box<dyn FnOnce(&mut EventLoop, IoId)>;

/// Identifier of a listener or stream registered with an `EventLoop`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct IoId {
    index: Index,
}

pub(crate) struct IoEntry {
    token: Token,
    source: Source,
    on_close: Option<CloseCallback>,
}

enum Source {
    Listener {
        listener: TcpListener,
        on_accept: Option<AcceptCallback>,
    },
    Stream(StreamState),
}

struct StreamState {
    stream: TcpStream,
    on_read: Option<ReadCallback>,

    /// Data accepted by `write` that the socket hasn't taken yet.
    pending: Vec<u8>,
    written: usize,
    writable_interest: bool,
    /// Close requested, waiting for `pending` to drain.
    closing: bool,

    read_timeout: Option<Duration>,
    last_active: Instant,
}

/// Failed to write to a stream.
#[derive(Error, Debug)]
pub enum WriteError {
    /// No stream found for id.
    #[error("no stream found for id")]
    NotFound,

    /// Stream is already closing.
    #[error("stream is closing")]
    Closing,

    /// The socket failed, the stream has been closed.
    #[error("stream write failed")]
    Io(#[from] std::io::Error),
}

impl EventLoop {
    /// Register a listener, calling `on_accept` for every accepted stream.
    ///
    /// Streams handed to `on_accept` are already non-blocking. An error returned by the callback
    /// is logged, and does not affect the listener.
    #[instrument("EventLoop::accept", skip_all)]
    pub fn accept<F>(&mut self, mut listener: TcpListener, on_accept: F) -> Result<IoId, Error>
    where
        F: FnMut(&mut EventLoop, TcpStream, SocketAddr) -> Result<(), Error> + 'static,
    {
        let token = self.token();
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;

        event!(Level::DEBUG, addr = ?listener.local_addr().ok(), "accepting");

        let source = Source::Listener {
            listener,
            on_accept: Some(Box::new(on_accept)),
        };
        Ok(self.insert_io(token, source))
    }

    /// Register a stream, calling `on_read` with every chunk of received data.
    ///
    /// The slice passed to `on_read` points into the loop's shared receive buffer, and is only
    /// valid for that one call.
    pub fn read<F>(&mut self, mut stream: TcpStream, on_read: F) -> Result<IoId, Error>
    where
        F: FnMut(&mut EventLoop, IoId, &[u8]) + 'static,
    {
        let token = self.token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;

        let state = StreamState {
            stream,
            on_read: Some(Box::new(on_read)),

            pending: Vec::new(),
            written: 0,
            writable_interest: false,
            closing: false,

            read_timeout: None,
            last_active: Instant::now(),
        };
        Ok(self.insert_io(token, Source::Stream(state)))
    }

    fn insert_io(&mut self, token: Token, source: Source) -> IoId {
        let entry = IoEntry {
            token,
            source,
            on_close: None,
        };
        let index = self.ios.insert(entry);
        self.tokens.insert(token, index);

        IoId { index }
    }

    /// Set the callback invoked once when the io is closed, from any path.
    pub fn set_close_callback<F>(&mut self, id: IoId, on_close: F)
    where
        F: FnOnce(&mut EventLoop, IoId) + 'static,
    {
        if let Some(entry) = self.ios.get_mut(id.index) {
            entry.on_close = Some(Box::new(on_close));
        }
    }

    /// Close the stream if it hasn't received data for `timeout`.
    pub fn set_read_timeout(&mut self, id: IoId, timeout: Option<Duration>) {
        if let Some(IoEntry {
            source: Source::Stream(state),
            ..
        }) = self.ios.get_mut(id.index)
        {
            state.read_timeout = timeout;
            state.last_active = Instant::now();
        }
    }

    pub fn is_open(&self, id: IoId) -> bool {
        self.ios.contains(id.index)
    }

    pub fn peer_addr(&self, id: IoId) -> Option<SocketAddr> {
        match &self.ios.get(id.index)?.source {
            Source::Stream(state) => state.stream.peer_addr().ok(),
            Source::Listener { .. } => None,
        }
    }

    pub fn local_addr(&self, id: IoId) -> Option<SocketAddr> {
        match &self.ios.get(id.index)?.source {
            Source::Stream(state) => state.stream.local_addr().ok(),
            Source::Listener { listener, .. } => listener.local_addr().ok(),
        }
    }

    /// Write data to a stream.
    ///
    /// One call is one write attempt on the socket. Whatever the socket doesn't take right
    /// away is queued, and flushed when the socket becomes writable again.
    pub fn write(&mut self, id: IoId, data: &[u8]) -> Result<(), WriteError> {
        let result = match self.ios.get_mut(id.index) {
            Some(IoEntry {
                token,
                source: Source::Stream(state),
                ..
            }) => {
                if state.closing {
                    return Err(WriteError::Closing);
                }
                state.queue(self.poll.registry(), *token, data)
            }
            _ => return Err(WriteError::NotFound),
        };

        if let Err(error) = result {
            event!(Level::DEBUG, ?error, "stream write failed");
            self.remove(id);
            return Err(error.into());
        }

        Ok(())
    }

    /// Close a listener or stream.
    ///
    /// A stream with queued data is closed once the data has been flushed. Closing an io that's
    /// already closed does nothing.
    pub fn close(&mut self, id: IoId) {
        let Some(entry) = self.ios.get_mut(id.index) else {
            return;
        };

        if let Source::Stream(state) = &mut entry.source {
            if state.has_pending() {
                event!(Level::TRACE, "deferring close until pending data is flushed");
                state.closing = true;
                return;
            }
        }

        self.remove(id);
    }

    fn remove(&mut self, id: IoId) {
        let Some(mut entry) = self.ios.remove(id.index) else {
            return;
        };
        self.tokens.remove(&entry.token);

        let registry = self.poll.registry();
        let result = match &mut entry.source {
            Source::Listener { listener, .. } => registry.deregister(listener),
            Source::Stream(state) => registry.deregister(&mut state.stream),
        };
        if let Err(error) = result {
            event!(Level::DEBUG, ?error, "failed to deregister source");
        }

        if let Some(on_close) = entry.on_close.take() {
            on_close(self, id);
        }

        // Dropping the entry drops its callbacks, and everything they own
    }

    pub(crate) fn on_readable(&mut self, index: Index) {
        let Some(entry) = self.ios.get(index) else {
            return;
        };

        if matches!(entry.source, Source::Listener { .. }) {
            self.on_listener_readable(index);
        } else {
            self.on_stream_readable(index);
        }
    }

    fn on_listener_readable(&mut self, index: Index) {
        // Borrow the callback out, so it can receive the loop
        let Some(IoEntry {
            source: Source::Listener { on_accept, .. },
            ..
        }) = self.ios.get_mut(index)
        else {
            return;
        };
        let Some(mut on_accept) = on_accept.take() else {
            return;
        };

        // Accept any pending streams
        loop {
            let Some(IoEntry {
                source: Source::Listener { listener, .. },
                ..
            }) = self.ios.get_mut(index)
            else {
                break;
            };

            let (stream, peer) = match check_io(listener.accept()) {
                Ok(Some(value)) => value,
                Ok(None) => break,
                Err(error) => {
                    event!(Level::ERROR, "failed to accept stream: {:#}", error);
                    break;
                }
            };

            event!(Level::DEBUG, ?peer, "stream accepted");
            if let Err(error) = on_accept(self, stream, peer) {
                event!(Level::ERROR, ?peer, "failed to set up stream: {:#}", error);
            }
        }

        // Return the callback, unless the listener got closed meanwhile
        if let Some(IoEntry {
            source: Source::Listener { on_accept: slot, .. },
            ..
        }) = self.ios.get_mut(index)
        {
            *slot = Some(on_accept);
        }
    }

    fn on_stream_readable(&mut self, index: Index) {
        let id = IoId { index };

        let Some(IoEntry {
            source: Source::Stream(state),
            ..
        }) = self.ios.get_mut(index)
        else {
            return;
        };
        if state.closing {
            return;
        }
        let Some(mut on_read) = state.on_read.take() else {
            return;
        };

        // The shared buffer leaves the loop while a callback looks at it
        let mut buffer = mem::take(&mut self.read_buffer);
        let mut eof = false;
        let mut failed = false;

        loop {
            let Some(IoEntry {
                source: Source::Stream(state),
                ..
            }) = self.ios.get_mut(index)
            else {
                break;
            };
            if state.closing {
                break;
            }

            match state.stream.read(&mut buffer) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(len) => {
                    state.last_active = Instant::now();
                    event!(Level::TRACE, count = len, "received data");
                    on_read(self, id, &buffer[..len]);
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        event!(Level::DEBUG, ?error, "stream read failed");
                        failed = true;
                        break;
                    }
                },
            }
        }

        self.read_buffer = buffer;

        if let Some(IoEntry {
            source: Source::Stream(state),
            ..
        }) = self.ios.get_mut(index)
        {
            state.on_read = Some(on_read);
        }

        if failed {
            self.remove(id);
        } else if eof {
            event!(Level::DEBUG, "stream closed by peer");
            self.close(id);
        }
    }

    pub(crate) fn on_writable(&mut self, index: Index) {
        let id = IoId { index };

        let result = match self.ios.get_mut(index) {
            Some(IoEntry {
                token,
                source: Source::Stream(state),
                ..
            }) => state.flush(self.poll.registry(), *token),
            _ => return,
        };

        if let Err(error) = result {
            event!(Level::DEBUG, ?error, "stream flush failed");
            self.remove(id);
            return;
        }

        // Finish a deferred close once everything went out
        let drained = matches!(
            self.ios.get(index),
            Some(IoEntry { source: Source::Stream(state), .. })
                if state.closing && !state.has_pending()
        );
        if drained {
            self.remove(id);
        }
    }

    pub(crate) fn expire_streams(&mut self, now: Instant) {
        let expired: Vec<Index> = self
            .ios
            .iter()
            .filter_map(|(index, entry)| match &entry.source {
                Source::Stream(state) => state
                    .read_timeout
                    .filter(|timeout| now.saturating_duration_since(state.last_active) >= *timeout)
                    .map(|_| index),
                Source::Listener { .. } => None,
            })
            .collect();

        for index in expired {
            event!(Level::DEBUG, "closing stream after read timeout");
            self.remove(IoId { index });
        }
    }
}

impl StreamState {
    fn has_pending(&self) -> bool {
        self.written < self.pending.len()
    }

    fn queue(&mut self, registry: &Registry, token: Token, data: &[u8]) -> std::io::Result<()> {
        let mut offset = 0;
        if !self.has_pending() {
            offset = write_some(&mut self.stream, data)?;
        }

        if offset < data.len() {
            event!(
                Level::TRACE,
                count = data.len() - offset,
                "queueing unsent data"
            );
            self.pending.extend_from_slice(&data[offset..]);

            if !self.writable_interest {
                let interest = Interest::READABLE | Interest::WRITABLE;
                registry.reregister(&mut self.stream, token, interest)?;
                self.writable_interest = true;
            }
        }

        Ok(())
    }

    fn flush(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        if !self.has_pending() {
            return Ok(());
        }

        let written = write_some(&mut self.stream, &self.pending[self.written..])?;
        self.written += written;

        if !self.has_pending() {
            self.pending.clear();
            self.written = 0;

            if self.writable_interest {
                registry.reregister(&mut self.stream, token, Interest::READABLE)?;
                self.writable_interest = false;
            }
        }

        Ok(())
    }
}

/// Write as much of `data` as the socket takes without blocking.
fn write_some(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<usize> {
    let mut written = 0;

    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(len) => written += len,
            Err(error) => match error.kind() {
                ErrorKind::WouldBlock => break,
                ErrorKind::Interrupted => continue,
                _ => return Err(error),
            },
        }
    }

    Ok(written)
}
