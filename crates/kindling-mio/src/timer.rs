use std::time::{Duration, Instant};

use thunderdome::Index;
use tracing::{event, Level};

use crate::EventLoop;

type TimerCallback = Box<dyn FnMut(&mut EventLoop, TimerId)>;
type IdleCallback = Box<dyn FnMut(&mut EventLoop)>;

/// Identifier of a timer added to an `EventLoop`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct TimerId {
    index: Index,
}

/// Identifier of an idle task added to an `EventLoop`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct IdleId {
    index: Index,
}

/// How often a timer fires.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Repeat {
    /// Fire once, then remove the timer.
    Once,
    /// Fire every period until removed.
    Forever,
}

pub(crate) struct TimerEntry {
    deadline: Instant,
    period: Duration,
    repeat: Repeat,
    callback: Option<TimerCallback>,
}

pub(crate) struct IdleEntry {
    callback: Option<IdleCallback>,
}

impl EventLoop {
    /// Add a timer, first firing after `period`.
    ///
    /// A callback can remove its own timer through the `TimerId` it receives.
    pub fn add_timer<F>(&mut self, period: Duration, repeat: Repeat, callback: F) -> TimerId
    where
        F: FnMut(&mut EventLoop, TimerId) + 'static,
    {
        let entry = TimerEntry {
            deadline: Instant::now() + period,
            period,
            repeat,
            callback: Some(Box::new(callback)),
        };
        let index = self.timers.insert(entry);

        TimerId { index }
    }

    /// Remove a timer, returns false if it was already gone.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove(id.index).is_some()
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.contains(id.index)
    }

    /// Add a task that runs whenever an iteration had nothing else to do.
    pub fn add_idle<F>(&mut self, callback: F) -> IdleId
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let entry = IdleEntry {
            callback: Some(Box::new(callback)),
        };
        let index = self.idles.insert(entry);

        IdleId { index }
    }

    pub fn remove_idle(&mut self, id: IdleId) -> bool {
        self.idles.remove(id.index).is_some()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|(_, timer)| timer.deadline).min()
    }

    /// Fire all timers due at `now`, returns how many fired.
    pub(crate) fn fire_timers(&mut self, now: Instant) -> usize {
        let due: Vec<Index> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(index, _)| index)
            .collect();
        let count = due.len();

        for index in due {
            let id = TimerId { index };
            let Some(mut callback) = self
                .timers
                .get_mut(index)
                .and_then(|timer| timer.callback.take())
            else {
                continue;
            };

            event!(Level::TRACE, "firing timer");
            callback(self, id);

            // The callback may have removed its own timer
            let Some(timer) = self.timers.get_mut(index) else {
                continue;
            };

            match timer.repeat {
                Repeat::Once => {
                    self.timers.remove(index);
                }
                Repeat::Forever => {
                    timer.deadline = now + timer.period;
                    timer.callback = Some(callback);
                }
            }
        }

        count
    }

    pub(crate) fn run_idles(&mut self) {
        let indices: Vec<Index> = self.idles.iter().map(|(index, _)| index).collect();

        for index in indices {
            let Some(mut callback) = self
                .idles
                .get_mut(index)
                .and_then(|idle| idle.callback.take())
            else {
                continue;
            };

            callback(self);

            if let Some(idle) = self.idles.get_mut(index) {
                idle.callback = Some(callback);
            }
        }
    }
}
