use std::{
    cell::RefCell,
    io::Write,
    net::SocketAddr,
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Error};
use kindling_http::{FileCache, HttpHandler, Service, Transport};
use kindling_mio::{EventLoop, IoId, Repeat, TimerId};
use mio::net::{TcpListener, TcpStream};
use tracing::{event, instrument, Level};

use crate::{process, ServerConfig};

/// Shortest period of the cache sweep.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);
const STOP_CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Run one worker's event loop on `listener` until `stop` is set.
#[instrument("run_worker", skip_all)]
pub fn run_worker(
    listener: std::net::TcpListener,
    service: Arc<dyn Service>,
    config: &ServerConfig,
    stop: Arc<AtomicBool>,
) -> Result<(), Error> {
    listener
        .set_nonblocking(true)
        .context("failed to make listener non-blocking")?;
    let listener = TcpListener::from_std(listener);

    let mut event_loop = EventLoop::new(config.recv_buffer_size)?;
    let files = Rc::new(RefCell::new(FileCache::new(config.file_cache_ttl)));

    setup_worker(&mut event_loop, listener, service, files, config, stop)?;

    event!(Level::INFO, "worker running");
    event_loop.run()?;

    Ok(())
}

/// Register a worker's listener, cache sweep and housekeeping on `event_loop`.
pub fn setup_worker(
    event_loop: &mut EventLoop,
    listener: TcpListener,
    service: Arc<dyn Service>,
    files: Rc<RefCell<FileCache>>,
    config: &ServerConfig,
    stop: Arc<AtomicBool>,
) -> Result<(), Error> {
    let read_timeout = config.read_timeout;
    let dispatch_files = files.clone();
    event_loop.accept(listener, move |event_loop, stream, peer| {
        dispatch(
            event_loop,
            stream,
            peer,
            &service,
            &dispatch_files,
            read_timeout,
        )
    })?;

    add_cache_sweep(event_loop, Rc::downgrade(&files), config.file_cache_ttl);

    event_loop.add_timer(STOP_CHECK_PERIOD, Repeat::Forever, move |event_loop, _| {
        if stop.load(Ordering::SeqCst) {
            event!(Level::DEBUG, "stop requested");
            event_loop.stop();
        }
    });

    event_loop.add_idle(move |_| {
        // Flush log output while there's nothing else to do
        if let Err(error) = std::io::stdout().flush() {
            event!(Level::TRACE, ?error, "failed to flush stdout");
        }
        if let Err(error) = std::io::stderr().flush() {
            event!(Level::TRACE, ?error, "failed to flush stderr");
        }

        if process::take_reload_request() {
            event!(Level::INFO, "reload requested");
            files.borrow_mut().clear();
        }
    });

    Ok(())
}

/// Set up a freshly accepted connection.
fn dispatch(
    event_loop: &mut EventLoop,
    stream: TcpStream,
    peer: SocketAddr,
    service: &Arc<dyn Service>,
    files: &Rc<RefCell<FileCache>>,
    read_timeout: Option<Duration>,
) -> Result<(), Error> {
    event!(Level::DEBUG, %peer, "accepted connection");

    let mut handler = HttpHandler::new(peer, service.clone(), files.clone());
    let id = event_loop.read(stream, move |event_loop, id, data| {
        let mut transport = LoopTransport {
            event_loop: &mut *event_loop,
            id,
        };

        if handler.on_read(data, &mut transport).is_break() {
            event_loop.close(id);
        }
    })?;

    event_loop.set_read_timeout(id, read_timeout);
    event_loop.set_close_callback(id, move |_, _| {
        event!(Level::DEBUG, %peer, "connection closed");
    });

    Ok(())
}

/// Periodically evict cache entries older than `ttl`.
///
/// The sweep removes its own timer once the cache is gone.
pub fn add_cache_sweep(
    event_loop: &mut EventLoop,
    files: Weak<RefCell<FileCache>>,
    ttl: Duration,
) -> TimerId {
    let period = ttl.max(MIN_SWEEP_PERIOD);

    event_loop.add_timer(period, Repeat::Forever, move |event_loop, id| {
        let Some(files) = files.upgrade() else {
            event!(Level::DEBUG, "file cache gone, stopping sweep");
            event_loop.remove_timer(id);
            return;
        };

        let evicted = files.borrow_mut().sweep(Instant::now());
        event!(Level::TRACE, evicted, "file cache sweep");
    })
}

/// Writes responses to a connection of the event loop.
struct LoopTransport<'a> {
    event_loop: &'a mut EventLoop,
    id: IoId,
}

impl Transport for LoopTransport<'_> {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.event_loop.write(self.id, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kindling_http::CacheEntry;
    use tracing_test::traced_test;

    use super::*;

    fn run_for(event_loop: &mut EventLoop, duration: Duration) -> Result<(), Error> {
        let until = Instant::now() + duration;
        while Instant::now() < until {
            event_loop.run_once(Some(Duration::from_millis(10)))?;
        }
        Ok(())
    }

    #[test]
    #[traced_test]
    fn sweep_evicts_expired_entries() -> Result<(), Error> {
        let mut event_loop = EventLoop::new(64)?;
        let ttl = Duration::from_millis(100);
        let files = Rc::new(RefCell::new(FileCache::new(ttl)));

        let old = Instant::now() - Duration::from_secs(1);
        files.borrow_mut().insert(CacheEntry::new("/old", "old", old));
        files
            .borrow_mut()
            .insert(CacheEntry::new("/young", "young", Instant::now() + Duration::from_secs(60)));

        let timer = add_cache_sweep(&mut event_loop, Rc::downgrade(&files), ttl);
        run_for(&mut event_loop, Duration::from_millis(250))?;

        let files = files.borrow();
        assert!(files.get(std::path::Path::new("/old")).is_none());
        assert!(files.get(std::path::Path::new("/young")).is_some());
        assert!(event_loop.has_timer(timer));

        Ok(())
    }

    #[test]
    #[traced_test]
    fn sweep_stops_when_cache_is_gone() -> Result<(), Error> {
        let mut event_loop = EventLoop::new(64)?;
        let files = Rc::new(RefCell::new(FileCache::new(Duration::ZERO)));

        let timer = add_cache_sweep(&mut event_loop, Rc::downgrade(&files), Duration::ZERO);
        drop(files);
        run_for(&mut event_loop, Duration::from_millis(250))?;

        assert!(!event_loop.has_timer(timer));

        Ok(())
    }
}
