//! Composable continuations keyed to a reactor.
//!
//! A future is fulfilled with a value or an error. Registering a
//! continuation after fulfillment still runs it, on the next loop iteration.
//! Streaming futures may be fulfilled repeatedly: extra fulfillments queue
//! up, and [`Future::take`] (or [`Future::reset`]) re-arms the future for
//! the next one.
//!
//! These are not `std::future::Future` values; handlers never block the
//! loop, and a continuation can carry its originating request as captured
//! context.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::reactor::{Reactor, Watcher};

/// Continuation callback, invoked with the fulfilled future.
pub type Continuation<T> = Box<dyn FnMut(&Future<T>)>;

struct Inner<T> {
    reactor: Reactor,
    slot: Option<Result<T>>,
    backlog: VecDeque<Result<T>>,
    continuation: Option<Continuation<T>>,
    trigger: Option<Watcher>,
    scheduled: bool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(w) = self.trigger.take() {
            w.destroy();
        }
    }
}

/// A fulfillable continuation cell. Cheap to clone; all clones observe the
/// same fulfillments.
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future").finish_non_exhaustive()
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Future<T> {
    #[must_use]
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                reactor: reactor.clone(),
                slot: None,
                backlog: VecDeque::new(),
                continuation: None,
                trigger: None,
                scheduled: false,
            })),
        }
    }

    #[must_use]
    pub fn reactor(&self) -> Reactor {
        self.inner.borrow().reactor.clone()
    }

    /// Fulfill with a value or error. The first fulfillment lands in the
    /// slot; later ones queue until the slot is consumed.
    pub fn fulfill(&self, result: Result<T>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.slot.is_none() {
                inner.slot = Some(result);
            } else {
                inner.backlog.push_back(result);
            }
        }
        self.schedule();
    }

    /// Shorthand for fulfilling with a wire error.
    pub fn fulfill_err(&self, errnum: i32, msg: impl Into<String>) {
        self.fulfill(Err(Error::from_wire(errnum, msg)));
    }

    /// Register the continuation, replacing any previous one. If the future
    /// is already fulfilled the continuation runs on the next loop iteration.
    pub fn then(&self, cb: Continuation<T>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.continuation = Some(cb);
        }
        self.schedule();
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.borrow().slot.is_some()
    }

    /// Consume the current fulfillment. If more are queued, the next one
    /// moves into the slot and the continuation is scheduled again.
    pub fn take(&self) -> Option<Result<T>> {
        let taken = {
            let mut inner = self.inner.borrow_mut();
            let taken = inner.slot.take();
            if taken.is_some() {
                if let Some(next) = inner.backlog.pop_front() {
                    inner.slot = Some(next);
                }
            }
            taken
        };
        if taken.is_some() {
            self.schedule();
        }
        taken
    }

    /// Discard the current fulfillment and await the next.
    pub fn reset(&self) {
        let _ = self.take();
    }

    /// Run the reactor until fulfilled, then consume the result. Bounded by
    /// `timeout`; used by sequential drivers, never by handlers.
    pub fn wait_within(&self, timeout: Duration) -> Result<T> {
        let reactor = self.reactor();
        let deadline = Instant::now() + timeout;
        // A dummy timer bounds the poll so the deadline is honored even
        // with nothing else pending.
        let guard = reactor.timer_watcher(timeout.as_secs_f64(), 0.0, Box::new(|_, _, _| {}));
        guard.start()?;
        let result = loop {
            if let Some(result) = self.take() {
                break result;
            }
            if Instant::now() >= deadline {
                break Err(Error::Timeout);
            }
            if let Err(e) = reactor.run_once() {
                break Err(e);
            }
        };
        guard.destroy();
        result
    }

    /// Arrange for the continuation to run on the next loop iteration.
    fn schedule(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.scheduled || inner.continuation.is_none() || inner.slot.is_none() {
            return;
        }
        inner.scheduled = true;
        let weak = Rc::downgrade(&self.inner);
        let trigger = inner.reactor.timer_watcher(
            0.0,
            0.0,
            Box::new(move |_, _, _| {
                let Some(strong) = weak.upgrade() else { return };
                let fut = Future { inner: strong };
                fut.deliver();
            }),
        );
        if let Some(old) = inner.trigger.replace(trigger) {
            old.destroy();
        }
        let _ = inner
            .trigger
            .as_ref()
            .expect("just placed")
            .start();
    }

    /// Invoke the continuation with no inner borrow held.
    fn deliver(&self) {
        let cb = {
            let mut inner = self.inner.borrow_mut();
            inner.scheduled = false;
            if inner.slot.is_none() {
                return; // consumed before delivery
            }
            inner.continuation.take()
        };
        let Some(mut cb) = cb else { return };
        cb(self);
        {
            let mut inner = self.inner.borrow_mut();
            if inner.continuation.is_none() {
                inner.continuation = Some(cb);
            }
        }
        // A queued fulfillment may have moved into the slot while the
        // continuation ran; it could not reschedule with the continuation
        // checked out.
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn spin_until(reactor: &Reactor, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let tick = reactor.timer_watcher(0.001, 0.001, Box::new(|_, _, _| {}));
        tick.start().unwrap();
        while !done() {
            assert!(Instant::now() < deadline, "spin_until timed out");
            reactor.run_once().unwrap();
        }
        tick.destroy();
    }

    #[test]
    fn continuation_runs_after_fulfill() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<u32> = Future::new(&reactor);
        let got = Rc::new(Cell::new(0));

        let got2 = got.clone();
        fut.then(Box::new(move |f| {
            let v = f.take().unwrap().unwrap();
            got2.set(v);
        }));
        fut.fulfill(Ok(7));
        spin_until(&reactor, || got.get() == 7);
    }

    #[test]
    fn then_after_fulfillment_still_fires() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<u32> = Future::new(&reactor);
        fut.fulfill(Ok(9));

        let got = Rc::new(Cell::new(0));
        let got2 = got.clone();
        fut.then(Box::new(move |f| {
            got2.set(f.take().unwrap().unwrap());
        }));
        assert_eq!(got.get(), 0, "continuation is deferred to the next iteration");
        spin_until(&reactor, || got.get() == 9);
    }

    #[test]
    fn streaming_fulfillments_queue() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<u32> = Future::new(&reactor);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen2 = seen.clone();
        fut.then(Box::new(move |f| {
            if let Some(Ok(v)) = f.take() {
                seen2.borrow_mut().push(v);
            }
        }));
        fut.fulfill(Ok(1));
        fut.fulfill(Ok(2));
        fut.fulfill(Ok(3));
        spin_until(&reactor, || seen.borrow().len() == 3);
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn reset_discards_current_fulfillment() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<u32> = Future::new(&reactor);
        fut.fulfill(Ok(1));
        fut.fulfill(Ok(2));
        fut.reset();
        assert_eq!(fut.take().unwrap().unwrap(), 2);
        assert!(!fut.is_ready());
    }

    #[test]
    fn wait_within_returns_value() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<&'static str> = Future::new(&reactor);

        let f = fut.clone();
        let t = reactor.timer_watcher(
            0.005,
            0.0,
            Box::new(move |_, _, _| {
                f.fulfill(Ok("done"));
            }),
        );
        t.start().unwrap();
        assert_eq!(fut.wait_within(Duration::from_secs(5)).unwrap(), "done");
        t.destroy();
    }

    #[test]
    fn wait_within_times_out() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<u32> = Future::new(&reactor);
        let err = fut.wait_within(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn error_fulfillment_carries_errnum() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<u32> = Future::new(&reactor);
        fut.fulfill_err(61, "");
        let err = fut.take().unwrap().unwrap_err();
        assert!(err.is_stream_end());
    }

    #[test]
    fn continuation_may_drop_its_future() {
        let reactor = Reactor::new().unwrap();
        let fut: Future<u32> = Future::new(&reactor);
        let done = Rc::new(Cell::new(false));

        let done2 = done.clone();
        let holder = Rc::new(RefCell::new(Some(fut.clone())));
        let holder2 = holder.clone();
        fut.then(Box::new(move |f| {
            let _ = f.take();
            holder2.borrow_mut().take(); // drop an outer handle from inside
            done2.set(true);
        }));
        drop(fut);
        holder.borrow().as_ref().unwrap().fulfill(Ok(1));
        spin_until(&reactor, || done.get());
    }
}
