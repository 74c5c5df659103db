//! Platform poller built on the `polling` crate.
//!
//! This is the one module that needs `unsafe`: `polling` cannot prove at
//! compile time that a raw descriptor stays valid for the lifetime of its
//! registration, so `Poller::add` is an `unsafe fn` and `modify`/`delete`
//! want a [`BorrowedFd`]. The crate-wide `deny(unsafe_code)` is relaxed
//! here for exactly those call sites; the safety argument is the same for
//! all of them and is stated on each block: descriptors are registered by
//! their owner, the owner unregisters before closing (sockets unregister
//! in their teardown path while the stream is still held), and the
//! registration table is the source of truth for which descriptors are
//! live.

use super::{Event, Events, Interest, PollBackend, PollType};
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use polling::{Event as PollEvent, Events as PollEvents, Poller};
use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

/// Readiness backend over the platform's epoll/kqueue, via [`polling`].
///
/// `polling` delivers notifications in oneshot mode: once a descriptor
/// fires, its registration is disarmed until re-added. [`wait`] re-arms
/// every reported descriptor with its stored interest before returning, so
/// callers observe plain level-triggered behavior and gate writable
/// interest through [`modify`] the way they would with classic `poll(2)`.
///
/// Error and hangup conditions have no distinct representation in
/// `polling`; the kernel folds them into read/write readiness, and the
/// consumer discovers the specifics from the failing I/O call (or
/// `SO_ERROR` for a pending connect).
///
/// [`wait`]: PollBackend::wait
/// [`modify`]: PollBackend::modify
pub struct SystemPoller {
    poller: Poller,
    registrations: Mutex<HashMap<RawFd, Interest>>,
}

impl SystemPoller {
    /// Creates a poller using the platform-default mechanism.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a poller, requiring a specific mechanism.
    ///
    /// The `polling` crate always selects the platform mechanism, so any
    /// request other than that one (or `Default`) is refused.
    pub fn with_type(poll_type: PollType) -> io::Result<Self> {
        if poll_type.resolved() != PollType::Default.resolved() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "requested poll mechanism is not available on this platform",
            ));
        }
        Self::new()
    }

    fn to_poll_event(fd: RawFd, interest: Interest) -> PollEvent {
        let key = fd as usize;
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(key),
            (true, false) => PollEvent::readable(key),
            (false, true) => PollEvent::writable(key),
            (false, false) => PollEvent::none(key),
        }
    }

    fn to_interest(event: &PollEvent) -> Interest {
        let mut ready = Interest::NONE;
        if event.readable {
            ready = ready.add(Interest::READABLE);
        }
        if event.writable {
            ready = ready.add(Interest::WRITABLE);
        }
        ready
    }

    /// Re-arms a registered descriptor with `interest`.
    ///
    /// Callers must hold the registration lock with `fd` present in the
    /// table, which is what makes the borrow sound.
    #[allow(unsafe_code)]
    fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        // SAFETY: `fd` is in the registration table, so its owner has not
        // closed it (owners unregister before closing). The borrow lasts
        // only for this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.modify(borrowed, Self::to_poll_event(fd, interest))
    }
}

impl PollBackend for SystemPoller {
    #[allow(unsafe_code)]
    fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut regs = self.registrations.lock();
        if regs.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already watched",
            ));
        }
        // SAFETY: the registering owner keeps `fd` open for the lifetime
        // of the registration and calls `remove` before closing it, so the
        // poller never holds a dangling descriptor.
        unsafe {
            self.poller.add(fd, Self::to_poll_event(fd, interest))?;
        }
        regs.insert(fd, interest);
        trace!(fd, "poller add");
        Ok(())
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut regs = self.registrations.lock();
        if !regs.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not watched",
            ));
        }
        self.rearm(fd, interest)?;
        regs.insert(fd, interest);
        Ok(())
    }

    #[allow(unsafe_code)]
    fn remove(&self, fd: RawFd) -> io::Result<()> {
        let mut regs = self.registrations.lock();
        if regs.remove(&fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not watched",
            ));
        }
        // SAFETY: owners call `remove` while the descriptor is still open
        // (socket teardown unregisters before dropping the stream), so the
        // borrow is over a live descriptor.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.delete(borrowed)?;
        trace!(fd, "poller remove");
        Ok(())
    }

    fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let mut raw = PollEvents::new();
        self.poller.wait(&mut raw, timeout)?;

        let regs = self.registrations.lock();
        let mut delivered = 0;
        for ev in raw.iter() {
            let fd = ev.key as RawFd;
            // Skip descriptors unregistered since the kernel queued the event.
            let Some(&interest) = regs.get(&fd) else {
                continue;
            };
            // Oneshot delivery disarmed the registration; restore it so the
            // consumer sees level-triggered behavior.
            self.rearm(fd, interest)?;
            events.push(Event::new(fd, Self::to_interest(&ev)));
            delivered += 1;
        }
        Ok(delivered)
    }

    fn wakeup(&self) -> io::Result<()> {
        self.poller.notify()
    }

    fn watched(&self) -> usize {
        self.registrations.lock().len()
    }

    fn poll_type(&self) -> PollType {
        PollType::Default.resolved()
    }

    fn is_level_triggered(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for SystemPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemPoller")
            .field("watched", &self.watched())
            .field("poll_type", &self.poll_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn watched_set_tracks_registrations() {
        let poller = SystemPoller::new().expect("create poller");
        let (a, _a2) = UnixStream::pair().expect("socket pair");
        let (b, _b2) = UnixStream::pair().expect("socket pair");

        assert_eq!(poller.watched(), 0);
        poller.add(a.as_raw_fd(), Interest::readable()).unwrap();
        poller.add(b.as_raw_fd(), Interest::writable()).unwrap();
        assert_eq!(poller.watched(), 2);

        poller.remove(a.as_raw_fd()).unwrap();
        assert_eq!(poller.watched(), 1);
        poller.remove(b.as_raw_fd()).unwrap();
        assert_eq!(poller.watched(), 0);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let poller = SystemPoller::new().expect("create poller");
        let (a, _a2) = UnixStream::pair().expect("socket pair");
        poller.add(a.as_raw_fd(), Interest::readable()).unwrap();
        let err = poller
            .add(a.as_raw_fd(), Interest::readable())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        poller.remove(a.as_raw_fd()).unwrap();
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let poller = SystemPoller::new().expect("create poller");
        let err = poller.remove(12_345).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn modify_unknown_is_not_found() {
        let poller = SystemPoller::new().expect("create poller");
        let err = poller.modify(12_345, Interest::readable()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn readable_event_is_delivered_and_rearmed() {
        let poller = SystemPoller::new().expect("create poller");
        let (reader, mut writer) = UnixStream::pair().expect("socket pair");
        reader.set_nonblocking(true).unwrap();
        poller.add(reader.as_raw_fd(), Interest::readable()).unwrap();

        use std::io::Write;
        writer.write_all(b"x").unwrap();

        let mut events = Events::with_capacity(8);
        poller
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.len(), 1);
        let ev = events.iter().next().unwrap();
        assert_eq!(ev.fd, reader.as_raw_fd());
        assert!(ev.ready.is_readable());

        // Data is still buffered, so a level-triggered poller reports again.
        poller
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.len(), 1);
        poller.remove(reader.as_raw_fd()).unwrap();
    }

    #[test]
    fn wakeup_unblocks_wait() {
        use std::sync::Arc;
        let poller = Arc::new(SystemPoller::new().expect("create poller"));
        let waker = Arc::clone(&poller);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker.wakeup().expect("wakeup");
        });

        let mut events = Events::with_capacity(8);
        let start = std::time::Instant::now();
        poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}
