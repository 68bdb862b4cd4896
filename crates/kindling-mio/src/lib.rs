//! Single-threaded, callback driven event loop on top of mio.
//!
//! One `EventLoop` owns its sockets, timers and idle tasks. Every callback receives the loop
//! mutably and runs to completion before the next event is dispatched, so state shared between
//! callbacks of one loop needs no locking.

mod event_loop;
mod io;
mod timer;

use std::io::ErrorKind;

use anyhow::Error;

pub use self::{
    event_loop::EventLoop,
    io::{IoId, WriteError},
    timer::{IdleId, Repeat, TimerId},
};

fn check_io<T>(value: Result<T, std::io::Error>) -> Result<Option<T>, Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            // WouldBlock just means we've run out of things to handle
            if error.kind() == ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(error.into())
            }
        }
    }
}
