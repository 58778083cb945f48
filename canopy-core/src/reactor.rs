//! Single-threaded cooperative event loop.
//!
//! The reactor multiplexes file descriptors, timers, signals, child exits,
//! and per-iteration hooks (prepare/check/idle) over one OS poller. Every
//! watcher carries an `active` bit (started/stopped) and a `referenced` bit;
//! [`Reactor::run`] returns once no active referenced watcher remains.
//!
//! Callback dispatch order within one iteration: prepare, poll, fd/timer/
//! signal/child, check, idle. Active idle watchers force a zero-timeout poll
//! so the loop keeps turning.
//!
//! `run_once` may be invoked from inside a callback (a handler spinning the
//! loop while it waits on a future); all loop state is borrowed only
//! transiently to keep that re-entrancy safe.

#![allow(unsafe_code)] // one waitpid call in the child-watcher path

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::{Error, Result};

/// Readiness bits for fd watchers, used both as interest and as revents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdEvents(u8);

impl FdEvents {
    pub const READABLE: Self = Self(0x1);
    pub const WRITABLE: Self = Self(0x2);
    pub const ERROR: Self = Self(0x4);

    #[must_use]
    pub const fn readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[must_use]
    pub const fn writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[must_use]
    pub const fn error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// What fired, passed to every watcher callback.
#[derive(Debug, Clone, Copy)]
pub enum Fire {
    Fd(FdEvents),
    Timer,
    Signal(i32),
    Child { pid: i32, status: i32 },
    Prepare,
    Check,
    Idle,
}

/// Watcher callback. Receives the reactor and a handle to the firing
/// watcher, so a callback can stop or destroy itself.
pub type Callback = Box<dyn FnMut(&Reactor, &Watcher, Fire)>;

enum Kind {
    Fd {
        fd: RawFd,
        interest: FdEvents,
    },
    Timer {
        after: f64,
        repeat: f64,
        generation: u64,
    },
    Signal {
        signo: i32,
        pipe: Option<SignalPipe>,
    },
    Child {
        pid: i32,
        probe: bool,
    },
    Prepare,
    Check,
    Idle,
    /// Internal SIGCHLD funnel feeding the child watchers.
    ChildFunnel {
        pipe: Option<SignalPipe>,
    },
}

struct SignalPipe {
    read: UnixStream,
    _write: UnixStream,
    sigid: signal_hook::SigId,
}

impl SignalPipe {
    fn new(signo: i32) -> Result<Self> {
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;
        let sigid = signal_hook::low_level::pipe::register_raw(signo, write.as_raw_fd())?;
        Ok(Self {
            read,
            _write: write,
            sigid,
        })
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 64];
        while matches!(self.read.read(&mut buf), Ok(n) if n > 0) {}
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.sigid);
    }
}

struct Entry {
    kind: Kind,
    serial: u64,
    active: bool,
    referenced: bool,
    cb: Option<Callback>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    id: usize,
    generation: u64,
}

struct State {
    watchers: Slab<Entry>,
    timers: BinaryHeap<Reverse<Deadline>>,
    next_serial: u64,
    active_refed: usize,
    stopped: bool,
    child_funnel: Option<usize>,
}

struct Io {
    poll: Poll,
    events: Events,
}

struct Inner {
    io: RefCell<Io>,
    registry: Registry,
    state: RefCell<State>,
}

/// The reactor handle. Cheap to clone; all clones refer to one loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

/// A handle to a registered watcher. Cheap to clone; operations on a
/// destroyed watcher are no-ops.
#[derive(Clone)]
pub struct Watcher {
    reactor: Weak<Inner>,
    id: usize,
    serial: u64,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            inner: Rc::new(Inner {
                io: RefCell::new(Io {
                    poll,
                    events: Events::with_capacity(256),
                }),
                registry,
                state: RefCell::new(State {
                    watchers: Slab::new(),
                    timers: BinaryHeap::new(),
                    next_serial: 1,
                    active_refed: 0,
                    stopped: false,
                    child_funnel: None,
                }),
            }),
        })
    }

    /// Number of active referenced watchers; the loop runs while positive.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.state.borrow().active_refed
    }

    /// Ask the loop to return after the current iteration.
    pub fn stop(&self) {
        self.inner.state.borrow_mut().stopped = true;
    }

    /// Run until no active referenced watcher remains or [`stop`] is called.
    ///
    /// [`stop`]: Reactor::stop
    pub fn run(&self) -> Result<()> {
        self.inner.state.borrow_mut().stopped = false;
        loop {
            {
                let state = self.inner.state.borrow();
                if state.stopped || state.active_refed == 0 {
                    return Ok(());
                }
            }
            self.run_once()?;
        }
    }

    /// One loop iteration: prepare, poll, dispatch, check, idle.
    ///
    /// Safe to call from inside a watcher callback; a handler waiting on a
    /// future spins the loop this way.
    pub fn run_once(&self) -> Result<()> {
        self.fire_kind(KindSelect::Prepare, Fire::Prepare);

        let timeout = self.poll_timeout();
        let ready = self.poll(timeout)?;
        for (id, serial, revents) in ready {
            self.dispatch_io(id, serial, revents);
        }

        self.expire_timers();
        self.probe_children();
        self.fire_kind(KindSelect::Check, Fire::Check);
        self.fire_kind(KindSelect::Idle, Fire::Idle);
        Ok(())
    }

    // === watcher constructors ===

    /// Watch a file descriptor for readiness. The fd must outlive the
    /// watcher's active periods.
    pub fn fd_watcher(&self, fd: RawFd, interest: FdEvents, cb: Callback) -> Watcher {
        self.add(Kind::Fd { fd, interest }, cb)
    }

    /// One-shot or repeating timer, in seconds. A one-shot timer stops
    /// itself after firing; a repeating timer rearms every `repeat` seconds.
    pub fn timer_watcher(&self, after: f64, repeat: f64, cb: Callback) -> Watcher {
        self.add(
            Kind::Timer {
                after,
                repeat,
                generation: 0,
            },
            cb,
        )
    }

    /// Watch for a signal, delivered through a self-pipe so no process-wide
    /// signal mask is touched.
    pub fn signal_watcher(&self, signo: i32, cb: Callback) -> Watcher {
        self.add(Kind::Signal { signo, pipe: None }, cb)
    }

    /// Watch for the exit of a specific child pid. Fires once with the raw
    /// wait status, then stops itself.
    pub fn child_watcher(&self, pid: i32, cb: Callback) -> Watcher {
        self.add(Kind::Child { pid, probe: false }, cb)
    }

    /// Run before the poll in each iteration.
    pub fn prepare_watcher(&self, cb: Callback) -> Watcher {
        self.add(Kind::Prepare, cb)
    }

    /// Run after the poll in each iteration.
    pub fn check_watcher(&self, cb: Callback) -> Watcher {
        self.add(Kind::Check, cb)
    }

    /// Run every iteration and force the poll not to block.
    pub fn idle_watcher(&self, cb: Callback) -> Watcher {
        self.add(Kind::Idle, cb)
    }

    fn add(&self, kind: Kind, cb: Callback) -> Watcher {
        let mut state = self.inner.state.borrow_mut();
        let serial = state.next_serial;
        state.next_serial += 1;
        let id = state.watchers.insert(Entry {
            kind,
            serial,
            active: false,
            referenced: true,
            cb: Some(cb),
        });
        Watcher {
            reactor: Rc::downgrade(&self.inner),
            id,
            serial,
        }
    }

    // === internals ===

    fn poll_timeout(&self) -> Option<Duration> {
        let state = self.inner.state.borrow();
        let idle_active = state
            .watchers
            .iter()
            .any(|(_, e)| e.active && matches!(e.kind, Kind::Idle));
        let probe_pending = state
            .watchers
            .iter()
            .any(|(_, e)| e.active && matches!(e.kind, Kind::Child { probe: true, .. }));
        if idle_active || probe_pending {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        state
            .timers
            .peek()
            .map(|Reverse(d)| d.at.saturating_duration_since(now))
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<Vec<(usize, u64, FdEvents)>> {
        let mut io = self.inner.io.borrow_mut();
        let io = &mut *io;
        match io.poll.poll(&mut io.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        }
        let state = self.inner.state.borrow();
        let mut ready = Vec::new();
        for event in io.events.iter() {
            let id = event.token().0;
            let Some(entry) = state.watchers.get(id) else {
                continue;
            };
            let mut revents = FdEvents::default();
            if event.is_readable() {
                revents = revents.union(FdEvents::READABLE);
            }
            if event.is_writable() {
                revents = revents.union(FdEvents::WRITABLE);
            }
            if event.is_error() || event.is_read_closed() {
                revents = revents.union(FdEvents::ERROR);
            }
            ready.push((id, entry.serial, revents));
        }
        Ok(ready)
    }

    fn dispatch_io(&self, id: usize, serial: u64, revents: FdEvents) {
        enum Action {
            Fd,
            Signal(i32),
            Funnel,
        }
        let action = {
            let mut state = self.inner.state.borrow_mut();
            let Some(entry) = state.watchers.get_mut(id) else {
                return;
            };
            if entry.serial != serial || !entry.active {
                return; // stopped since the poll; pending callback cancelled
            }
            match &mut entry.kind {
                Kind::Fd { .. } => Action::Fd,
                Kind::Signal { signo, pipe } => {
                    if let Some(p) = pipe {
                        p.drain();
                    }
                    Action::Signal(*signo)
                }
                Kind::ChildFunnel { pipe } => {
                    if let Some(p) = pipe {
                        p.drain();
                    }
                    Action::Funnel
                }
                _ => return,
            }
        };
        match action {
            Action::Fd => self.invoke(id, serial, Fire::Fd(revents)),
            Action::Signal(signo) => self.invoke(id, serial, Fire::Signal(signo)),
            Action::Funnel => {
                let mut state = self.inner.state.borrow_mut();
                for (_, e) in state.watchers.iter_mut() {
                    if let Kind::Child { probe, .. } = &mut e.kind {
                        if e.active {
                            *probe = true;
                        }
                    }
                }
            }
        }
    }

    fn expire_timers(&self) {
        let now = Instant::now();
        loop {
            let popped = {
                let mut state = self.inner.state.borrow_mut();
                if state.timers.peek().map_or(true, |Reverse(d)| d.at > now) {
                    None
                } else {
                    state.timers.pop()
                }
            };
            let Some(Reverse(due)) = popped else { break };

            let fire = {
                let mut guard = self.inner.state.borrow_mut();
                let state = &mut *guard;
                let Some(entry) = state.watchers.get_mut(due.id) else {
                    continue;
                };
                let Kind::Timer {
                    repeat, generation, ..
                } = &entry.kind
                else {
                    continue;
                };
                if *generation != due.generation || !entry.active {
                    continue; // stale deadline from a stopped or restarted timer
                }
                let serial = entry.serial;
                let one_shot = *repeat <= 0.0;
                if !one_shot {
                    let deadline = Deadline {
                        at: now + Duration::from_secs_f64(*repeat),
                        id: due.id,
                        generation: *generation,
                    };
                    state.timers.push(Reverse(deadline));
                }
                (due.id, serial, one_shot)
            };
            let (id, serial, one_shot) = fire;
            if one_shot {
                self.watcher_stop(id, serial);
            }
            self.invoke(id, serial, Fire::Timer);
        }
    }

    fn probe_children(&self) {
        let probes: Vec<(usize, u64, i32)> = {
            let mut state = self.inner.state.borrow_mut();
            state
                .watchers
                .iter_mut()
                .filter_map(|(id, e)| match &mut e.kind {
                    Kind::Child { pid, probe } if e.active && *probe => {
                        *probe = false;
                        Some((id, e.serial, *pid))
                    }
                    _ => None,
                })
                .collect()
        };
        for (id, serial, pid) in probes {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == pid {
                self.watcher_stop(id, serial);
                self.invoke(id, serial, Fire::Child { pid, status });
            }
        }
    }

    fn fire_kind(&self, select: KindSelect, fire: Fire) {
        let targets: Vec<(usize, u64)> = {
            let state = self.inner.state.borrow();
            state
                .watchers
                .iter()
                .filter(|(_, e)| e.active && select.matches(&e.kind))
                .map(|(id, e)| (id, e.serial))
                .collect()
        };
        for (id, serial) in targets {
            self.invoke(id, serial, fire);
        }
    }

    /// Take the callback out, call it with no state borrow held, put it back.
    fn invoke(&self, id: usize, serial: u64, fire: Fire) {
        let cb = {
            let mut state = self.inner.state.borrow_mut();
            let Some(entry) = state.watchers.get_mut(id) else {
                return;
            };
            if entry.serial != serial {
                return;
            }
            // Deferred kinds must still be active at delivery time, except a
            // one-shot timer or exited child that was just auto-stopped.
            match (&fire, entry.active) {
                (Fire::Timer | Fire::Child { .. }, _) => {}
                (_, false) => return,
                (_, true) => {}
            }
            entry.cb.take()
        };
        let Some(mut cb) = cb else {
            return; // re-entrant fire while already in this callback
        };
        let watcher = Watcher {
            reactor: Rc::downgrade(&self.inner),
            id,
            serial,
        };
        cb(self, &watcher, fire);
        let mut state = self.inner.state.borrow_mut();
        if let Some(entry) = state.watchers.get_mut(id) {
            if entry.serial == serial && entry.cb.is_none() {
                entry.cb = Some(cb);
            }
        }
    }

    fn watcher_start(&self, id: usize, serial: u64) -> Result<()> {
        // A first child watcher lazily creates the SIGCHLD funnel; do that
        // before borrowing loop state, since it registers a watcher itself.
        let needs_funnel = {
            let state = self.inner.state.borrow();
            state.watchers.get(id).map_or(false, |e| {
                e.serial == serial && !e.active && matches!(e.kind, Kind::Child { .. })
            })
        };
        if needs_funnel {
            self.ensure_child_funnel()?;
        }

        let mut guard = self.inner.state.borrow_mut();
        let state = &mut *guard;
        let Some(entry) = state.watchers.get_mut(id) else {
            return Ok(());
        };
        if entry.serial != serial || entry.active {
            return Ok(()); // starting an active watcher is a no-op
        }
        match &mut entry.kind {
            Kind::Fd { fd, interest } => {
                let mio_interest = match (interest.readable(), interest.writable()) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (false, true) => Interest::WRITABLE,
                    _ => Interest::READABLE,
                };
                self.inner
                    .registry
                    .register(&mut SourceFd(fd), Token(id), mio_interest)?;
            }
            Kind::Timer {
                after, generation, ..
            } => {
                *generation += 1;
                let deadline = Deadline {
                    at: Instant::now() + Duration::from_secs_f64((*after).max(0.0)),
                    id,
                    generation: *generation,
                };
                state.timers.push(Reverse(deadline));
            }
            Kind::Signal { signo, pipe } => {
                let p = SignalPipe::new(*signo)?;
                self.inner.registry.register(
                    &mut SourceFd(&p.read.as_raw_fd()),
                    Token(id),
                    Interest::READABLE,
                )?;
                *pipe = Some(p);
            }
            Kind::Child { probe, .. } => {
                *probe = true; // the child may already have exited
            }
            Kind::ChildFunnel { pipe } => {
                let p = SignalPipe::new(signal_hook::consts::SIGCHLD)?;
                self.inner.registry.register(
                    &mut SourceFd(&p.read.as_raw_fd()),
                    Token(id),
                    Interest::READABLE,
                )?;
                *pipe = Some(p);
            }
            Kind::Prepare | Kind::Check | Kind::Idle => {}
        }
        entry.active = true;
        if entry.referenced {
            state.active_refed += 1;
        }
        Ok(())
    }

    fn watcher_stop(&self, id: usize, serial: u64) {
        let mut guard = self.inner.state.borrow_mut();
        let state = &mut *guard;
        let Some(entry) = state.watchers.get_mut(id) else {
            return;
        };
        if entry.serial != serial || !entry.active {
            return;
        }
        match &mut entry.kind {
            Kind::Fd { fd, .. } => {
                let _ = self.inner.registry.deregister(&mut SourceFd(fd));
            }
            Kind::Timer { generation, .. } => {
                *generation += 1; // invalidate queued deadlines
            }
            Kind::Signal { pipe, .. } | Kind::ChildFunnel { pipe } => {
                if let Some(p) = pipe.take() {
                    let _ = self
                        .inner
                        .registry
                        .deregister(&mut SourceFd(&p.read.as_raw_fd()));
                }
            }
            Kind::Child { probe, .. } => *probe = false,
            Kind::Prepare | Kind::Check | Kind::Idle => {}
        }
        entry.active = false;
        if entry.referenced {
            state.active_refed -= 1;
        }
    }

    fn ensure_child_funnel(&self) -> Result<()> {
        let existing = self.inner.state.borrow().child_funnel;
        if existing.is_none() {
            let w = self.add(Kind::ChildFunnel { pipe: None }, Box::new(|_, _, _| {}));
            w.unref_loop(); // internal; must not hold the loop open
            w.start()?;
            self.inner.state.borrow_mut().child_funnel = Some(w.id);
        }
        Ok(())
    }
}

enum KindSelect {
    Prepare,
    Check,
    Idle,
}

impl KindSelect {
    fn matches(&self, kind: &Kind) -> bool {
        matches!(
            (self, kind),
            (Self::Prepare, Kind::Prepare) | (Self::Check, Kind::Check) | (Self::Idle, Kind::Idle)
        )
    }
}

impl Watcher {
    fn with_inner<R>(&self, f: impl FnOnce(&Reactor) -> R) -> Option<R> {
        self.reactor.upgrade().map(|inner| f(&Reactor { inner }))
    }

    /// Start the watcher. A no-op when already active.
    pub fn start(&self) -> Result<()> {
        self.with_inner(|r| r.watcher_start(self.id, self.serial))
            .unwrap_or(Ok(()))
    }

    /// Stop the watcher and cancel any pending callback.
    pub fn stop(&self) {
        self.with_inner(|r| r.watcher_stop(self.id, self.serial));
    }

    /// Re-include this watcher in the loop exit accounting. Idempotent.
    pub fn ref_loop(&self) {
        self.with_inner(|r| {
            let mut state = r.inner.state.borrow_mut();
            if let Some(entry) = state.watchers.get_mut(self.id) {
                if entry.serial == self.serial && !entry.referenced {
                    entry.referenced = true;
                    if entry.active {
                        state.active_refed += 1;
                    }
                }
            }
        });
    }

    /// Exclude this watcher from the loop exit accounting. Idempotent.
    pub fn unref_loop(&self) {
        self.with_inner(|r| {
            let mut state = r.inner.state.borrow_mut();
            if let Some(entry) = state.watchers.get_mut(self.id) {
                if entry.serial == self.serial && entry.referenced {
                    entry.referenced = false;
                    if entry.active {
                        state.active_refed -= 1;
                    }
                }
            }
        });
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.with_inner(|r| {
            let state = r.inner.state.borrow();
            state
                .watchers
                .get(self.id)
                .is_some_and(|e| e.serial == self.serial && e.active)
        })
        .unwrap_or(false)
    }

    /// Stop the watcher and remove it from the reactor. Further operations
    /// through other clones of this handle become no-ops.
    pub fn destroy(&self) {
        self.stop();
        self.with_inner(|r| {
            let mut state = r.inner.state.borrow_mut();
            let remove = state
                .watchers
                .get(self.id)
                .is_some_and(|e| e.serial == self.serial);
            if remove {
                trace!(id = self.id, "[reactor] watcher destroyed");
                state.watchers.remove(self.id);
                if state.child_funnel == Some(self.id) {
                    state.child_funnel = None;
                }
            }
        });
    }
}
