//! Timer queue for deadline-ordered callbacks.
//!
//! A min-heap of `(deadline, seq)` pairs; `seq` is the insertion counter so
//! that timers armed for the same instant fire in FIFO order. Periodic
//! timers re-enter the heap with a fresh sequence number after firing.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

type TimerCallback = Rc<RefCell<dyn FnMut()>>;

struct TimerShared {
    cancelled: Cell<bool>,
}

/// Cancellation handle for a scheduled timer.
///
/// Dropping the handle does not cancel the timer; call
/// [`cancel`](Self::cancel). Cancellation is idempotent and takes effect the
/// next time the queue examines the entry.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    /// Cancels the timer.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancelled.set(true);
        }
    }

    /// Returns true if the timer is still armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|s| !s.cancelled.get())
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    period: Option<Duration>,
    shared: Rc<TimerShared>,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest deadline first, insertion order
        // breaking ties.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An expired timer popped from the queue, ready to be fired.
pub(crate) struct ExpiredTimer {
    period: Option<Duration>,
    shared: Rc<TimerShared>,
    callback: TimerCallback,
}

impl ExpiredTimer {
    /// Runs the callback unless the timer was cancelled in the meantime.
    pub(crate) fn fire(&self) {
        if !self.shared.cancelled.get() {
            (self.callback.borrow_mut())();
        }
    }

    /// Returns the rearm delay if this timer is periodic and still live.
    pub(crate) fn rearm_period(&self) -> Option<Duration> {
        if self.shared.cancelled.get() {
            None
        } else {
            self.period
        }
    }

    fn into_parts(self) -> (Option<Duration>, Rc<TimerShared>, TimerCallback) {
        (self.period, self.shared, self.callback)
    }
}

/// Deadline-ordered set of pending timers.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Arms a timer and returns its cancellation handle.
    pub(crate) fn schedule(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let shared = Rc::new(TimerShared {
            cancelled: Cell::new(false),
        });
        let handle = TimerHandle {
            shared: Rc::downgrade(&shared),
        };
        self.push(Instant::now() + delay, period, shared, callback);
        handle
    }

    fn push(
        &mut self,
        deadline: Instant,
        period: Option<Duration>,
        shared: Rc<TimerShared>,
        callback: TimerCallback,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            period,
            shared,
            callback,
        });
    }

    /// Re-arms a fired periodic timer, keeping its cancellation handle live.
    pub(crate) fn rearm(&mut self, expired: ExpiredTimer) {
        let (period, shared, callback) = expired.into_parts();
        if let Some(period) = period {
            self.push(Instant::now() + period, Some(period), shared, callback);
        }
    }

    /// Earliest live deadline, if any. Cancelled heads are discarded here.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if entry.shared.cancelled.get() {
                self.heap.pop();
            } else {
                return Some(entry.deadline);
            }
        }
        None
    }

    /// Pops every entry with `deadline <= now`, in deadline order.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<ExpiredTimer> {
        let mut expired = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };
            if entry.shared.cancelled.get() {
                continue;
            }
            expired.push(ExpiredTimer {
                period: entry.period,
                shared: entry.shared,
                callback: entry.callback,
            });
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb(log: &Rc<RefCell<Vec<u32>>>, id: u32) -> TimerCallback {
        let log = Rc::clone(log);
        Rc::new(RefCell::new(move || log.borrow_mut().push(id)))
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.schedule(Duration::from_millis(50), None, cb(&log, 1));
        queue.schedule(Duration::from_millis(10), None, cb(&log, 2));
        queue.schedule(Duration::from_millis(30), None, cb(&log, 3));

        let now = Instant::now() + Duration::from_millis(100);
        for timer in queue.pop_expired(now) {
            timer.fire();
        }
        assert_eq!(*log.borrow(), vec![2, 3, 1]);
    }

    #[test]
    fn equal_deadlines_fire_fifo() {
        let mut queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for id in 0..5 {
            queue.schedule(Duration::from_millis(20), None, cb(&log, id));
        }
        let now = Instant::now() + Duration::from_millis(50);
        for timer in queue.pop_expired(now) {
            timer.fire();
        }
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let handle = queue.schedule(Duration::from_millis(1), None, cb(&log, 1));
        handle.cancel();
        handle.cancel(); // idempotent
        assert!(!handle.is_armed());

        let now = Instant::now() + Duration::from_millis(10);
        for timer in queue.pop_expired(now) {
            timer.fire();
        }
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn cancelled_head_is_skipped_by_next_deadline() {
        let mut queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let first = queue.schedule(Duration::from_millis(1), None, cb(&log, 1));
        queue.schedule(Duration::from_millis(60_000), None, cb(&log, 2));
        first.cancel();

        let deadline = queue.next_deadline().expect("one live timer");
        assert!(deadline > Instant::now() + Duration::from_secs(30));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn periodic_timer_rearms() {
        let mut queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.schedule(
            Duration::from_millis(0),
            Some(Duration::from_millis(0)),
            cb(&log, 7),
        );

        for _ in 0..3 {
            let now = Instant::now() + Duration::from_millis(1);
            for timer in queue.pop_expired(now) {
                timer.fire();
                if timer.rearm_period().is_some() {
                    queue.rearm(timer);
                }
            }
        }
        assert_eq!(*log.borrow(), vec![7, 7, 7]);
    }
}
