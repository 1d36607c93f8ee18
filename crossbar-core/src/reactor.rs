//! Single-threaded readiness event loop.
//!
//! One loop drives every stream, listener, and client of a process. It
//! multiplexes three sources of work:
//! - readiness events from the OS selector, dispatched to per-token
//!   handlers;
//! - deferred one-shot callbacks, run after the current dispatch round
//!   (the mechanism the connection layers use to break recursion and to
//!   yield between outbound frames);
//! - absolute-time timers, for user code.
//!
//! Everything runs on the loop thread; handlers and callbacks never
//! observe another handler mid-update.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::event::Event;
use mio::{Events, Poll, Registry, Token};
use tracing::{debug, trace};

/// A readiness-driven participant of the loop.
pub trait EventHandler {
    fn on_ready(&mut self, event: &Event, ctx: &LoopCtx<'_>);
}

type Callback = Box<dyn FnOnce(&LoopCtx<'_>)>;

/// Identifier of a pending timer, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
}

impl Timers {
    fn add(&mut self, at: Instant, callback: Callback) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((at, id)));
        self.callbacks.insert(id, callback);
        TimerId(id)
    }

    fn cancel(&mut self, id: TimerId) {
        // The heap entry stays behind and is skipped when it comes due.
        self.callbacks.remove(&id.0);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    fn pop_due(&mut self, now: Instant) -> Option<Callback> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                return None;
            }
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&id) {
                return Some(callback);
            }
        }
        None
    }
}

struct LoopShared {
    handlers: RefCell<HashMap<Token, Rc<RefCell<dyn EventHandler>>>>,
    deferred: RefCell<VecDeque<Callback>>,
    timers: RefCell<Timers>,
    next_token: Cell<usize>,
    shutdown: Cell<bool>,
}

/// Cloneable handle usable from anywhere on the loop thread.
///
/// Unlike [`LoopCtx`] it carries no registry, so it can be stored inside
/// delivery handles and closures that outlive a single dispatch.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Rc<LoopShared>,
}

impl LoopHandle {
    /// Schedule `f` to run after the current dispatch round.
    pub fn defer(&self, f: impl FnOnce(&LoopCtx<'_>) + 'static) {
        self.shared.deferred.borrow_mut().push_back(Box::new(f));
    }

    /// Schedule `f` at an absolute time.
    pub fn add_timeout(&self, at: Instant, f: impl FnOnce(&LoopCtx<'_>) + 'static) -> TimerId {
        self.shared.timers.borrow_mut().add(at, Box::new(f))
    }

    pub fn cancel_timeout(&self, id: TimerId) {
        self.shared.timers.borrow_mut().cancel(id);
    }

    /// Stop the run loop after the current iteration.
    pub fn shutdown(&self) {
        self.shared.shutdown.set(true);
    }
}

/// Per-dispatch context handed to handlers, deferred callbacks, and
/// timers.
pub struct LoopCtx<'a> {
    /// Selector registry for (re)registering streams.
    pub registry: &'a Registry,
    shared: &'a Rc<LoopShared>,
}

impl LoopCtx<'_> {
    /// Allocate a fresh token for a new source.
    pub fn next_token(&self) -> Token {
        let token = self.shared.next_token.get();
        self.shared.next_token.set(token + 1);
        Token(token)
    }

    /// Attach a handler for a token. The source itself is registered
    /// through [`Self::registry`] by its owner.
    pub fn insert_handler(&self, token: Token, handler: Rc<RefCell<dyn EventHandler>>) {
        self.shared.handlers.borrow_mut().insert(token, handler);
    }

    /// Detach the handler of a token; events already queued for it are
    /// dropped on the floor.
    pub fn remove_handler(&self, token: Token) {
        self.shared.handlers.borrow_mut().remove(&token);
    }

    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Rc::clone(self.shared),
        }
    }

    pub fn defer(&self, f: impl FnOnce(&LoopCtx<'_>) + 'static) {
        self.shared.deferred.borrow_mut().push_back(Box::new(f));
    }

    pub fn add_timeout(&self, at: Instant, f: impl FnOnce(&LoopCtx<'_>) + 'static) -> TimerId {
        self.shared.timers.borrow_mut().add(at, Box::new(f))
    }

    pub fn cancel_timeout(&self, id: TimerId) {
        self.shared.timers.borrow_mut().cancel(id);
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.set(true);
    }
}

/// The event loop.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Rc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            shared: Rc::new(LoopShared {
                handlers: RefCell::new(HashMap::new()),
                deferred: RefCell::new(VecDeque::new()),
                timers: RefCell::new(Timers::default()),
                next_token: Cell::new(0),
                shutdown: Cell::new(false),
            }),
        })
    }

    /// Context for setup work done outside the run loop (binding
    /// listeners, connecting clients).
    #[must_use]
    pub fn ctx(&self) -> LoopCtx<'_> {
        LoopCtx {
            registry: self.poll.registry(),
            shared: &self.shared,
        }
    }

    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Rc::clone(&self.shared),
        }
    }

    /// Run until [`LoopHandle::shutdown`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.shared.shutdown.get() {
            self.poll_once(None)?;
        }
        trace!("event loop stopped");
        Ok(())
    }

    /// One loop iteration: poll (bounded by `max_wait`, pending deferred
    /// work, and the nearest timer), dispatch readiness, drain one batch
    /// of deferred callbacks, fire due timers.
    pub fn poll_once(&mut self, max_wait: Option<Duration>) -> io::Result<()> {
        let timeout = self.poll_timeout(max_wait);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            let handler = {
                let handlers = self.shared.handlers.borrow();
                handlers.get(&event.token()).map(Rc::clone)
            };
            let Some(handler) = handler else {
                debug!(token = event.token().0, "event for a closed stream");
                continue;
            };
            let ctx = LoopCtx {
                registry: self.poll.registry(),
                shared: &self.shared,
            };
            handler.borrow_mut().on_ready(event, &ctx);
        }

        // One batch only: callbacks deferred by this batch run in the
        // next iteration, after another poll. That gap is what makes
        // `defer` a genuine yield point.
        let batch: Vec<Callback> = self.shared.deferred.borrow_mut().drain(..).collect();
        for callback in batch {
            let ctx = LoopCtx {
                registry: self.poll.registry(),
                shared: &self.shared,
            };
            callback(&ctx);
        }

        loop {
            let due = {
                let mut timers = self.shared.timers.borrow_mut();
                timers.pop_due(Instant::now())
            };
            let Some(callback) = due else { break };
            let ctx = LoopCtx {
                registry: self.poll.registry(),
                shared: &self.shared,
            };
            callback(&ctx);
        }

        Ok(())
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if !self.shared.deferred.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        let until_timer = self
            .shared
            .timers
            .borrow()
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()));
        match (until_timer, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_callbacks_run_in_order_across_iterations() {
        let mut event_loop = EventLoop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handle = event_loop.handle();
        let log2 = Rc::clone(&log);
        handle.defer(move |ctx| {
            log2.borrow_mut().push(1);
            let log3 = Rc::clone(&log2);
            ctx.defer(move |_| log3.borrow_mut().push(3));
            log2.borrow_mut().push(2);
        });

        event_loop.poll_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(log.borrow().as_slice(), &[1, 2]);
        event_loop.poll_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(log.borrow().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn timers_fire_once_and_cancel() {
        let mut event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let handle = event_loop.handle();

        let f1 = Rc::clone(&fired);
        handle.add_timeout(Instant::now(), move |_| f1.set(f1.get() + 1));
        let f2 = Rc::clone(&fired);
        let cancelled = handle.add_timeout(Instant::now(), move |_| f2.set(f2.get() + 10));
        handle.cancel_timeout(cancelled);

        event_loop.poll_once(Some(Duration::ZERO)).unwrap();
        event_loop.poll_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn shutdown_stops_run() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        handle.defer(|ctx| ctx.shutdown());
        event_loop.run().unwrap();
    }
}
