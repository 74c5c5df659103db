//! Single-threaded reactor: readiness dispatch, timers, deferred tasks.
//!
//! An [`EventLoop`] owns one poll backend and one timer queue and drives
//! them from exactly one thread. Foreign threads interact with the loop
//! through a [`LoopHandle`], which enqueues work and wakes the backend.
//!
//! # Dispatch order
//!
//! Each [`run_once`](EventLoop::run_once) iteration executes, in order:
//!
//! 1. deferred tasks (cross-thread submissions in FIFO order, then
//!    loop-local ones),
//! 2. one backend wait, bounded by the nearest timer deadline,
//! 3. I/O callbacks in the order the backend reported readiness,
//! 4. expired timers in deadline order (FIFO on ties).
//!
//! Work submitted while a stage is dispatching becomes visible in stage 1
//! of the *next* iteration, which is the loop's fairness boundary.
//!
//! # Re-entrancy
//!
//! Callbacks may freely register or unregister descriptors, arm or cancel
//! timers, submit tasks, and stop the loop. Descriptor callbacks are looked
//! up per event against a generation counter, so a callback that
//! unregisters any descriptor (including its own) never causes a stale
//! dispatch. Callbacks must not call `run_once`/`run` recursively.

mod timer;

pub use timer::TimerHandle;

use crate::error::{Error, ErrorCode, Result};
use crate::poll::{Event, Events, Interest, PollBackend, PollType, SystemPoller};
use crate::tracing_compat::{debug, warn};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use timer::TimerQueue;

/// Observer notified when a loop is torn down.
///
/// Objects that cache a loop reference register themselves here so they can
/// drop it before the loop goes away.
pub trait LoopListener {
    /// Called once, when the loop is being destroyed.
    fn loop_stopped(&self);
}

type IoCallback = Rc<RefCell<dyn FnMut(Interest)>>;

struct IoEntry {
    callback: IoCallback,
    interest: Interest,
    generation: u64,
}

type SendTask = Box<dyn FnOnce() + Send>;
type LocalTask = Box<dyn FnOnce()>;

/// State reachable from foreign threads.
struct LoopShared {
    backend: Arc<dyn PollBackend>,
    tasks: Mutex<VecDeque<SendTask>>,
    stop: AtomicBool,
    thread: ThreadId,
}

struct LoopInner {
    shared: Arc<LoopShared>,
    io: RefCell<HashMap<RawFd, IoEntry>>,
    next_generation: Cell<u64>,
    timers: RefCell<TimerQueue>,
    local_tasks: RefCell<VecDeque<LocalTask>>,
    listeners: RefCell<Vec<Weak<dyn LoopListener>>>,
    events: RefCell<Events>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        for listener in self.listeners.borrow().iter() {
            if let Some(listener) = listener.upgrade() {
                listener.loop_stopped();
            }
        }
    }
}

/// A single-threaded reactor.
///
/// `EventLoop` is a cheap clone of a shared core (all clones drive the same
/// loop) and is deliberately `!Send`: every descriptor, timer, and callback
/// it owns belongs to the thread that created it. Cross-thread access goes
/// through [`handle`](Self::handle).
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop on the calling thread with the platform-default
    /// backend.
    pub fn new() -> Result<Self> {
        let backend =
            SystemPoller::new().map_err(|e| Error::new(ErrorCode::Failed).with_source(e))?;
        Ok(Self::from_backend(Arc::new(backend)))
    }

    /// Creates a loop with a specific poll mechanism.
    pub fn with_poll_type(poll_type: PollType) -> Result<Self> {
        let backend = SystemPoller::with_type(poll_type).map_err(|e| {
            let code = if e.kind() == io::ErrorKind::Unsupported {
                ErrorCode::Unsupported
            } else {
                ErrorCode::Failed
            };
            Error::new(code).with_source(e)
        })?;
        Ok(Self::from_backend(Arc::new(backend)))
    }

    /// Creates a loop over a caller-provided backend.
    #[must_use]
    pub fn from_backend(backend: Arc<dyn PollBackend>) -> Self {
        let shared = Arc::new(LoopShared {
            backend,
            tasks: Mutex::new(VecDeque::new()),
            stop: AtomicBool::new(false),
            thread: thread::current().id(),
        });
        Self {
            inner: Rc::new(LoopInner {
                shared,
                io: RefCell::new(HashMap::new()),
                next_generation: Cell::new(0),
                timers: RefCell::new(TimerQueue::new()),
                local_tasks: RefCell::new(VecDeque::new()),
                listeners: RefCell::new(Vec::new()),
                events: RefCell::new(Events::with_capacity(256)),
            }),
        }
    }

    /// Returns a `Send + Sync` handle for foreign-thread submissions.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// The backend mechanism in use.
    #[must_use]
    pub fn poll_type(&self) -> PollType {
        self.inner.shared.backend.poll_type()
    }

    /// True if the backend reports readiness for as long as it holds.
    #[must_use]
    pub fn is_level_triggered(&self) -> bool {
        self.inner.shared.backend.is_level_triggered()
    }

    /// True when called on the thread that owns this loop.
    #[must_use]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.shared.thread
    }

    /// Number of descriptors currently registered.
    #[must_use]
    pub fn registered_fds(&self) -> usize {
        self.inner.shared.backend.watched()
    }

    /// Registers `fd` with the backend and records its callback.
    ///
    /// Registration is loop-thread-only by construction (`EventLoop` does
    /// not cross threads); submit via [`LoopHandle::run_in_loop`] from
    /// elsewhere. Registering the same descriptor twice is
    /// [`ErrorCode::InvalidState`].
    pub fn register_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(Interest) + 'static,
    ) -> Result<()> {
        let mut io_table = self.inner.io.borrow_mut();
        if io_table.contains_key(&fd) {
            return Err(Error::new(ErrorCode::InvalidState)
                .with_context(format!("fd {fd} already registered")));
        }
        self.inner
            .shared
            .backend
            .add(fd, interest)
            .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))?;
        let generation = self.inner.next_generation.get();
        self.inner.next_generation.set(generation + 1);
        io_table.insert(
            fd,
            IoEntry {
                callback: Rc::new(RefCell::new(callback)),
                interest,
                generation,
            },
        );
        Ok(())
    }

    /// Replaces the interest mask of a registered descriptor.
    ///
    /// Under a level-triggered backend this is how writable interest is
    /// armed after a would-block and parked again once drained.
    pub fn update_fd(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut io_table = self.inner.io.borrow_mut();
        let entry = io_table.get_mut(&fd).ok_or_else(|| {
            Error::new(ErrorCode::InvalidState).with_context(format!("fd {fd} not registered"))
        })?;
        self.inner
            .shared
            .backend
            .modify(fd, interest)
            .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))?;
        entry.interest = interest;
        Ok(())
    }

    /// Removes a descriptor from the backend.
    ///
    /// Tolerates descriptors that were never registered. The descriptor is
    /// not closed; closing stays with whoever owns it.
    pub fn unregister_fd(&self, fd: RawFd) -> Result<()> {
        let removed = self.inner.io.borrow_mut().remove(&fd).is_some();
        if removed {
            if let Err(e) = self.inner.shared.backend.remove(fd) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(Error::new(ErrorCode::Failed).with_source(e));
                }
            }
        }
        Ok(())
    }

    /// Runs `f` immediately (the loop thread is the calling thread).
    ///
    /// Mirror of [`LoopHandle::run_in_loop`] for loop-owned code paths that
    /// hold non-`Send` state.
    pub fn run_in_loop(&self, f: impl FnOnce()) {
        f();
    }

    /// Defers `f` to stage 1 of the next iteration even though the caller
    /// is already on the loop thread.
    pub fn queue_in_loop(&self, f: impl FnOnce() + 'static) {
        self.inner.local_tasks.borrow_mut().push_back(Box::new(f));
        let _ = self.inner.shared.backend.wakeup();
    }

    /// Arms a one-shot timer.
    pub fn schedule_timer(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerHandle {
        self.inner
            .timers
            .borrow_mut()
            .schedule(delay, None, Rc::new(RefCell::new(callback)))
    }

    /// Arms a periodic timer with an initial delay equal to its period.
    pub fn schedule_periodic(
        &self,
        period: Duration,
        callback: impl FnMut() + 'static,
    ) -> TimerHandle {
        self.inner
            .timers
            .borrow_mut()
            .schedule(period, Some(period), Rc::new(RefCell::new(callback)))
    }

    /// Registers a lifecycle listener, held weakly.
    pub fn add_listener(&self, listener: &Rc<dyn LoopListener>) {
        self.inner
            .listeners
            .borrow_mut()
            .push(Rc::downgrade(listener));
    }

    /// Removes a previously added listener.
    pub fn remove_listener(&self, listener: &Rc<dyn LoopListener>) {
        self.inner
            .listeners
            .borrow_mut()
            .retain(|weak| weak.upgrade().is_some_and(|l| !Rc::ptr_eq(&l, listener)));
    }

    /// Wakes the backend if it is blocked in a wait.
    pub fn notify(&self) {
        let _ = self.inner.shared.backend.wakeup();
    }

    /// Requests loop exit and wakes the backend.
    pub fn stop(&self) {
        self.inner.shared.stop.store(true, Ordering::Release);
        let _ = self.inner.shared.backend.wakeup();
    }

    /// Runs one full iteration: tasks, poll, I/O dispatch, timers.
    ///
    /// `max_wait` bounds the blocking poll; the nearest timer deadline
    /// shortens it further. `None` blocks until readiness or wakeup.
    pub fn run_once(&self, max_wait: Option<Duration>) -> Result<()> {
        let inner = &self.inner;

        // Stage 1: deferred tasks. Drained into local buffers so tasks can
        // enqueue more work without deadlocking on the queue locks; the new
        // work runs next iteration.
        let cross: Vec<SendTask> = inner.shared.tasks.lock().drain(..).collect();
        for task in cross {
            run_contained(task);
        }
        let local: Vec<LocalTask> = inner.local_tasks.borrow_mut().drain(..).collect();
        for task in local {
            run_contained(task);
        }

        // Stage 2: poll, bounded by the nearest timer deadline.
        let wait = {
            let mut timers = inner.timers.borrow_mut();
            match timers.next_deadline() {
                Some(deadline) => {
                    let until = deadline.saturating_duration_since(Instant::now());
                    Some(max_wait.map_or(until, |m| m.min(until)))
                }
                None => max_wait,
            }
        };
        {
            let mut events = inner.events.borrow_mut();
            match inner.shared.backend.wait(&mut events, wait) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => events.clear(),
                Err(e) => {
                    warn!(error = %e, "poll backend wait failed");
                    return Err(Error::new(ErrorCode::PollError).with_source(e));
                }
            }
        }

        // Stage 3: I/O callbacks. Snapshot (event, generation) pairs first;
        // a callback may unregister or replace any descriptor, and a stale
        // generation means the event no longer belongs to anyone.
        let ready: Vec<(Event, u64)> = {
            let io_table = inner.io.borrow();
            inner
                .events
                .borrow()
                .iter()
                .filter_map(|ev| io_table.get(&ev.fd).map(|entry| (*ev, entry.generation)))
                .collect()
        };
        for (event, generation) in ready {
            let callback = {
                let io_table = inner.io.borrow();
                match io_table.get(&event.fd) {
                    Some(entry) if entry.generation == generation => Rc::clone(&entry.callback),
                    _ => {
                        debug!(fd = event.fd, "skipping stale io event");
                        continue;
                    }
                }
            };
            (callback.borrow_mut())(event.ready);
        }

        // Stage 4: expired timers, deadline order.
        let now = Instant::now();
        let expired = inner.timers.borrow_mut().pop_expired(now);
        for timer in &expired {
            timer.fire();
        }
        for timer in expired {
            if timer.rearm_period().is_some() {
                inner.timers.borrow_mut().rearm(timer);
            }
        }
        Ok(())
    }

    /// Repeats [`run_once`](Self::run_once) until [`stop`](Self::stop).
    ///
    /// A backend failure exits the loop with the error; per-descriptor
    /// problems never reach here (they surface through the owning socket).
    pub fn run(&self, max_wait: Option<Duration>) -> Result<()> {
        while !self.inner.shared.stop.load(Ordering::Acquire) {
            self.run_once(max_wait)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("poll_type", &self.poll_type())
            .field("registered_fds", &self.registered_fds())
            .field("timers", &self.inner.timers.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Cloneable, `Send + Sync` handle to an [`EventLoop`].
///
/// The handle outliving its loop is harmless: submissions after the loop
/// exits are never executed.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// True when called on the loop's owning thread.
    #[must_use]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// True once [`stop`](Self::stop) has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Runs `f` inline when on the loop thread, otherwise enqueues it and
    /// wakes the loop.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always enqueues `f`, even from the loop thread.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.tasks.lock().push_back(Box::new(f));
        let _ = self.shared.backend.wakeup();
    }

    /// Runs `f` on the loop thread and waits for its result.
    ///
    /// Calls from the loop thread itself run inline, which is what keeps
    /// this from self-deadlocking. Returns [`ErrorCode::InvalidState`] if
    /// the loop shuts down before executing the submission.
    pub fn run_in_loop_sync<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_in_loop_thread() {
            return Ok(f());
        }
        let (tx, rx) = mpsc::channel();
        self.queue_in_loop(move || {
            let _ = tx.send(f());
        });
        rx.recv().map_err(|_| {
            Error::new(ErrorCode::InvalidState).with_context("loop exited before submission ran")
        })
    }

    /// Wakes the loop's backend.
    pub fn notify(&self) {
        let _ = self.shared.backend.wakeup();
    }

    /// Requests loop exit and wakes the backend.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.shared.backend.wakeup();
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Runs a deferred task, containing panics to that task.
fn run_contained<F: FnOnce()>(task: F) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!("deferred task panicked; loop continues");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn watched_set_matches_registrations() {
        init_test_logging();
        let ev = EventLoop::new().unwrap();
        let (a, _a2) = UnixStream::pair().unwrap();
        let (b, _b2) = UnixStream::pair().unwrap();

        ev.register_fd(a.as_raw_fd(), Interest::readable(), |_| {})
            .unwrap();
        ev.register_fd(b.as_raw_fd(), Interest::readable(), |_| {})
            .unwrap();
        assert_eq!(ev.registered_fds(), 2);

        ev.unregister_fd(a.as_raw_fd()).unwrap();
        assert_eq!(ev.registered_fds(), 1);
        // Unknown fd is tolerated.
        ev.unregister_fd(a.as_raw_fd()).unwrap();
        ev.unregister_fd(b.as_raw_fd()).unwrap();
        assert_eq!(ev.registered_fds(), 0);
    }

    #[test]
    fn duplicate_registration_is_invalid_state() {
        let ev = EventLoop::new().unwrap();
        let (a, _a2) = UnixStream::pair().unwrap();
        ev.register_fd(a.as_raw_fd(), Interest::readable(), |_| {})
            .unwrap();
        let err = ev
            .register_fd(a.as_raw_fd(), Interest::readable(), |_| {})
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidState));
        ev.unregister_fd(a.as_raw_fd()).unwrap();
    }

    #[test]
    fn io_callback_fires_on_readable() {
        init_test_logging();
        let ev = EventLoop::new().unwrap();
        let (reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let hits = Rc::new(Cell::new(0));
        let hits_cb = Rc::clone(&hits);
        ev.register_fd(reader.as_raw_fd(), Interest::readable(), move |ready| {
            assert!(ready.is_readable());
            hits_cb.set(hits_cb.get() + 1);
        })
        .unwrap();

        use std::io::Write;
        writer.write_all(b"ping").unwrap();
        ev.run_once(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(hits.get(), 1);
        ev.unregister_fd(reader.as_raw_fd()).unwrap();
    }

    #[test]
    fn callback_may_unregister_itself() {
        let ev = EventLoop::new().unwrap();
        let (reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let ev_inner = ev.clone();
        let fd = reader.as_raw_fd();
        ev.register_fd(fd, Interest::readable(), move |_| {
            ev_inner.unregister_fd(fd).unwrap();
        })
        .unwrap();

        use std::io::Write;
        writer.write_all(b"x").unwrap();
        ev.run_once(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ev.registered_fds(), 0);
        // The still-buffered byte must not produce a stale dispatch.
        ev.run_once(Some(Duration::from_millis(20))).unwrap();
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        init_test_logging();
        let ev = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (delay_ms, tag) in [(50u64, 'a'), (10, 'b'), (30, 'c')] {
            let order = Rc::clone(&order);
            ev.schedule_timer(Duration::from_millis(delay_ms), move || {
                order.borrow_mut().push(tag);
            });
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while order.borrow().len() < 3 && Instant::now() < deadline {
            ev.run_once(Some(Duration::from_millis(100))).unwrap();
        }
        assert_eq!(*order.borrow(), vec!['b', 'c', 'a']);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let ev = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let fired_cb = Rc::clone(&fired);
        let handle = ev.schedule_timer(Duration::from_millis(5), move || {
            fired_cb.set(true);
        });
        handle.cancel();
        ev.run_once(Some(Duration::from_millis(30))).unwrap();
        ev.run_once(Some(Duration::from_millis(1))).unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn periodic_timer_rearms_until_cancelled() {
        let ev = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));
        let count_cb = Rc::clone(&count);
        let handle = ev.schedule_periodic(Duration::from_millis(5), move || {
            count_cb.set(count_cb.get() + 1);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.get() < 3 && Instant::now() < deadline {
            ev.run_once(Some(Duration::from_millis(20))).unwrap();
        }
        assert!(count.get() >= 3);
        handle.cancel();
        let settled = count.get();
        ev.run_once(Some(Duration::from_millis(20))).unwrap();
        ev.run_once(Some(Duration::from_millis(20))).unwrap();
        assert!(count.get() <= settled + 1);
    }

    #[test]
    fn run_in_loop_is_inline_on_loop_thread() {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        assert!(handle.is_in_loop_thread());
        let hit = Rc::new(Cell::new(false));
        let hit_cb = Rc::clone(&hit);
        // Inline execution: observable before any run_once.
        ev.run_in_loop(move || hit_cb.set(true));
        assert!(hit.get());
    }

    #[test]
    fn queued_task_runs_next_iteration() {
        let ev = EventLoop::new().unwrap();
        let hit = Rc::new(Cell::new(false));
        let hit_cb = Rc::clone(&hit);
        ev.queue_in_loop(move || hit_cb.set(true));
        assert!(!hit.get());
        ev.run_once(Some(Duration::from_millis(10))).unwrap();
        assert!(hit.get());
    }

    #[test]
    fn panicking_task_does_not_kill_loop() {
        init_test_logging();
        let ev = EventLoop::new().unwrap();
        ev.queue_in_loop(|| panic!("task panic"));
        let hit = Rc::new(Cell::new(false));
        let hit_cb = Rc::clone(&hit);
        ev.queue_in_loop(move || hit_cb.set(true));
        ev.run_once(Some(Duration::from_millis(10))).unwrap();
        assert!(hit.get());
    }

    #[test]
    fn run_in_loop_sync_inline_avoids_deadlock() {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let value = handle.run_in_loop_sync(|| 41 + 1).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn stop_exits_run() {
        let ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        ev.schedule_timer(Duration::from_millis(5), move || handle.stop());
        ev.run(Some(Duration::from_millis(50))).unwrap();
        assert!(ev.handle().is_stopped());
    }
}
