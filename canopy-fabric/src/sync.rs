//! Periodic tick futures.
//!
//! A sync timer fulfills its future every `min` seconds. Attaching a
//! continuation with a `max` bound additionally guarantees the continuation
//! runs no later than `max` after its previous run, whatever `min` is. The
//! overlay drives its keepalive and idle scans off one of these.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use canopy_core::error::Result;
use canopy_core::future::{Continuation, Future};
use canopy_core::reactor::{Reactor, Watcher};

pub struct SyncTimer {
    future: Future<()>,
    min_timer: Watcher,
    max_timer: Rc<RefCell<Option<Watcher>>>,
    reactor: Reactor,
}

impl SyncTimer {
    /// Start a tick every `min` seconds.
    pub fn new(reactor: &Reactor, min: Duration) -> Result<Self> {
        let future: Future<()> = Future::new(reactor);
        let fut = future.clone();
        let min_secs = min.as_secs_f64();
        let min_timer = reactor.timer_watcher(
            min_secs,
            min_secs,
            Box::new(move |_, _, _| {
                // Skip a beat rather than queue ticks behind a slow consumer.
                if !fut.is_ready() {
                    fut.fulfill(Ok(()));
                }
            }),
        );
        min_timer.start()?;
        Ok(Self {
            future,
            min_timer,
            max_timer: Rc::new(RefCell::new(None)),
            reactor: reactor.clone(),
        })
    }

    /// The underlying streaming future. Consumers `take()` or `reset()` each
    /// fulfillment.
    #[must_use]
    pub fn future(&self) -> Future<()> {
        self.future.clone()
    }

    /// Attach the continuation with an upper bound: it runs every `min`
    /// seconds, and in any case no later than `max` after its last run.
    pub fn then(&self, max: Duration, mut cb: Continuation<()>) {
        let fut = self.future.clone();
        let max_slot = self.max_timer.clone();
        let reactor = self.reactor.clone();
        let max_secs = max.as_secs_f64();

        let arm = move || {
            let deadline_fut = fut.clone();
            let deadline = reactor.timer_watcher(
                max_secs,
                0.0,
                Box::new(move |_, _, _| {
                    if !deadline_fut.is_ready() {
                        deadline_fut.fulfill(Ok(()));
                    }
                }),
            );
            let _ = deadline.start();
            if let Some(old) = max_slot.borrow_mut().replace(deadline) {
                old.destroy();
            }
        };

        let rearm = arm.clone();
        self.future.then(Box::new(move |f| {
            // Rearm the deadline before handing off; the continuation may
            // consume the fulfillment and wait a while.
            rearm();
            cb(f);
        }));
        // The bound applies from registration, not from the first tick.
        arm();
    }

    pub fn shutdown(&self) {
        self.min_timer.destroy();
        if let Some(w) = self.max_timer.borrow_mut().take() {
            w.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Instant;

    #[test]
    fn ticks_at_min_interval() {
        let reactor = Reactor::new().unwrap();
        let sync = SyncTimer::new(&reactor, Duration::from_millis(5)).unwrap();
        let ticks = Rc::new(Cell::new(0));

        let t = ticks.clone();
        let r = reactor.clone();
        sync.then(
            Duration::from_secs(10),
            Box::new(move |f| {
                f.reset();
                t.set(t.get() + 1);
                if t.get() == 3 {
                    r.stop();
                }
            }),
        );
        reactor.run().unwrap();
        assert_eq!(ticks.get(), 3);
        sync.shutdown();
    }

    #[test]
    fn max_bound_fires_when_min_is_long() {
        let reactor = Reactor::new().unwrap();
        // min far beyond the test horizon; max drives the tick.
        let sync = SyncTimer::new(&reactor, Duration::from_secs(3600)).unwrap();
        let ticks = Rc::new(Cell::new(0));

        let t = ticks.clone();
        let r = reactor.clone();
        sync.then(
            Duration::from_millis(10),
            Box::new(move |f| {
                f.reset();
                t.set(t.get() + 1);
                if t.get() == 2 {
                    r.stop();
                }
            }),
        );
        let start = Instant::now();
        reactor.run().unwrap();
        assert_eq!(ticks.get(), 2);
        assert!(start.elapsed() < Duration::from_secs(5));
        sync.shutdown();
    }
}
