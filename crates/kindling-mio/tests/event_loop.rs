use std::{
    cell::{Cell, RefCell},
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    rc::Rc,
    thread,
    time::Duration,
};

use anyhow::{bail, Error};
use kindling_mio::{EventLoop, IoId, Repeat};
use tracing_test::traced_test;

#[test]
#[traced_test]
fn timers_fire_by_repeat_mode() -> Result<(), Error> {
    let mut event_loop = EventLoop::new(64)?;

    let once = Rc::new(Cell::new(0));
    let counter = once.clone();
    event_loop.add_timer(Duration::from_millis(1), Repeat::Once, move |_, _| {
        counter.set(counter.get() + 1)
    });

    let forever = Rc::new(Cell::new(0));
    let counter = forever.clone();
    let timer = event_loop.add_timer(Duration::from_millis(1), Repeat::Forever, move |_, _| {
        counter.set(counter.get() + 1)
    });

    run_until(&mut event_loop, || forever.get() >= 3)?;

    assert_eq!(once.get(), 1);
    assert!(event_loop.has_timer(timer));

    Ok(())
}

#[test]
#[traced_test]
fn timer_can_remove_itself() -> Result<(), Error> {
    let mut event_loop = EventLoop::new(64)?;

    let fired = Rc::new(Cell::new(0));
    let counter = fired.clone();
    let timer = event_loop.add_timer(Duration::from_millis(1), Repeat::Forever, move |el, id| {
        counter.set(counter.get() + 1);
        el.remove_timer(id);
    });

    run_until(&mut event_loop, || fired.get() >= 1)?;
    for _ in 0..5 {
        event_loop.run_once(Some(Duration::from_millis(2)))?;
    }

    assert_eq!(fired.get(), 1);
    assert!(!event_loop.has_timer(timer));

    Ok(())
}

#[test]
#[traced_test]
fn idle_runs_when_nothing_happens() -> Result<(), Error> {
    let mut event_loop = EventLoop::new(64)?;

    let ticks = Rc::new(Cell::new(0));
    let counter = ticks.clone();
    event_loop.add_idle(move |_| counter.set(counter.get() + 1));

    event_loop.run_once(Some(Duration::from_millis(1)))?;
    assert_eq!(ticks.get(), 1);

    Ok(())
}

#[test]
fn zero_sized_read_buffer_is_rejected() {
    assert!(EventLoop::new(0).is_err());
}

#[test]
#[traced_test]
fn echo_through_shared_buffer() -> Result<(), Error> {
    let mut event_loop = EventLoop::new(8)?;
    let (listener, addr) = given_listener()?;

    let chunks = Rc::new(RefCell::new(Vec::<usize>::new()));
    let seen = chunks.clone();
    event_loop.accept(listener, move |el, stream, _peer| {
        let seen = seen.clone();
        el.read(stream, move |el, id, data| {
            seen.borrow_mut().push(data.len());
            let _ = el.write(id, data);
        })?;
        Ok(())
    })?;

    let mut client = given_client(addr)?;
    let message = b"a message longer than the buffer";
    client.write_all(message)?;

    let total = || chunks.borrow().iter().sum::<usize>();
    run_until(&mut event_loop, || total() >= message.len())?;

    let mut echo = vec![0; message.len()];
    client.read_exact(&mut echo)?;
    assert_eq!(&echo, message);
    assert!(chunks.borrow().iter().all(|len| *len <= 8));

    Ok(())
}

#[test]
#[traced_test]
fn close_is_idempotent_and_drops_callbacks() -> Result<(), Error> {
    let mut event_loop = EventLoop::new(64)?;
    let (listener, addr) = given_listener()?;

    let closed = Rc::new(Cell::new(0));
    let dropped = Rc::new(Cell::new(false));
    let stream_id = Rc::new(Cell::new(None::<IoId>));

    let (on_closed, on_dropped, on_id) = (closed.clone(), dropped.clone(), stream_id.clone());
    event_loop.accept(listener, move |el, stream, _peer| {
        let guard = DropFlag(on_dropped.clone());
        let id = el.read(stream, move |el, id, _data| {
            let _guard = &guard;
            el.close(id);
            el.close(id);
        })?;

        let on_closed = on_closed.clone();
        el.set_close_callback(id, move |_, _| on_closed.set(on_closed.get() + 1));
        on_id.set(Some(id));
        Ok(())
    })?;

    let mut client = given_client(addr)?;
    client.write_all(b"bye")?;
    run_until(&mut event_loop, || closed.get() > 0)?;

    let id = stream_id.get().expect("stream accepted");
    event_loop.close(id);

    assert_eq!(closed.get(), 1);
    assert!(dropped.get());
    assert!(!event_loop.is_open(id));

    // The server side is gone, so the client sees end of stream
    let mut rest = Vec::new();
    client.read_to_end(&mut rest)?;
    assert!(rest.is_empty());

    Ok(())
}

#[test]
#[traced_test]
fn read_timeout_closes_idle_stream() -> Result<(), Error> {
    let mut event_loop = EventLoop::new(64)?;
    let (listener, addr) = given_listener()?;

    let closed = Rc::new(Cell::new(false));
    let on_closed = closed.clone();
    event_loop.accept(listener, move |el, stream, _peer| {
        let id = el.read(stream, |_, _, _| {})?;
        el.set_read_timeout(id, Some(Duration::from_millis(20)));

        let on_closed = on_closed.clone();
        el.set_close_callback(id, move |_, _| on_closed.set(true));
        Ok(())
    })?;

    let _client = given_client(addr)?;
    run_until(&mut event_loop, || closed.get())?;

    Ok(())
}

#[test]
#[traced_test]
fn large_write_is_flushed_before_close() -> Result<(), Error> {
    const SIZE: usize = 8 * 1024 * 1024;

    let mut event_loop = EventLoop::new(64)?;
    let (listener, addr) = given_listener()?;

    let closed = Rc::new(Cell::new(false));
    let on_closed = closed.clone();
    event_loop.accept(listener, move |el, stream, _peer| {
        let id = el.read(stream, |el, id, _data| {
            let data = vec![7u8; SIZE];
            let _ = el.write(id, &data);
            el.close(id);
        })?;

        let on_closed = on_closed.clone();
        el.set_close_callback(id, move |_, _| on_closed.set(true));
        Ok(())
    })?;

    let mut client = given_client(addr)?;
    client.write_all(b"go")?;
    let reader = thread::spawn(move || -> std::io::Result<usize> {
        let mut received = Vec::new();
        client.read_to_end(&mut received)?;
        Ok(received.len())
    });

    run_until(&mut event_loop, || closed.get())?;

    let received = reader.join().expect("reader thread panicked")?;
    assert_eq!(received, SIZE);

    Ok(())
}

struct DropFlag(Rc<Cell<bool>>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

fn given_listener() -> Result<(mio::net::TcpListener, SocketAddr), Error> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    Ok((mio::net::TcpListener::from_std(listener), addr))
}

fn given_client(addr: SocketAddr) -> Result<TcpStream, Error> {
    let client = TcpStream::connect(addr)?;
    client.set_read_timeout(Some(Duration::from_secs(5)))?;
    Ok(client)
}

fn run_until<F>(event_loop: &mut EventLoop, mut done: F) -> Result<(), Error>
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if done() {
            return Ok(());
        }
        event_loop.run_once(Some(Duration::from_millis(10)))?;
    }

    bail!("condition not reached in time")
}
