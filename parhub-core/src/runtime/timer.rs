//! Deadline-ordered timer queue
//!
//! Timers are cancelled lazily: a cancelled timer keeps its heap slot and
//! fires as a no-op when it comes due.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback run when a timer fires; receives the reactor state and the queue
/// so it can re-arm itself or schedule follow-ups
pub type TimerCallback<S> = Box<dyn FnOnce(&mut S, &mut TimerQueue<S>) + Send>;

/// Revocation token for a scheduled timer
#[derive(Debug, Clone)]
pub struct TimerHandle {
    active: Arc<AtomicBool>,
    deadline: Instant,
}

impl TimerHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::Acquire)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Mark the timer inactive; it will be skipped when due
    pub fn cancel(&self) {
        self.active.store(false, AtomicOrdering::Release);
    }
}

struct Entry<S> {
    deadline: Instant,
    seq: u64,
    active: Arc<AtomicBool>,
    callback: TimerCallback<S>,
}

impl<S> PartialEq for Entry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<S> Eq for Entry<S> {}

impl<S> PartialOrd for Entry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Entry<S> {
    // Reversed so the max-heap yields the earliest deadline; ties by insertion
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of deadline-ordered callbacks
pub struct TimerQueue<S> {
    heap: BinaryHeap<Entry<S>>,
    seq: u64,
}

impl<S> TimerQueue<S> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Fire `callback` after `delay`
    pub fn schedule<F>(&mut self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut S, &mut TimerQueue<S>) + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, callback)
    }

    /// Fire `callback` at `deadline`
    pub fn schedule_at<F>(&mut self, deadline: Instant, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut S, &mut TimerQueue<S>) + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        self.seq += 1;
        self.heap.push(Entry {
            deadline,
            seq: self.seq,
            active: active.clone(),
            callback: Box::new(callback),
        });
        TimerHandle { active, deadline }
    }

    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    /// Time until the earliest timer is due, zero if overdue, `None` if empty.
    /// Cancelled timers still count.
    pub fn next_wait(&self) -> Option<Duration> {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Run every timer due now, in deadline order; returns how many callbacks
    /// actually ran. Timers scheduled by these callbacks wait for the next
    /// pass even if already due.
    pub fn fire_due(&mut self, state: &mut S) -> usize {
        let now = Instant::now();
        let horizon = self.seq;
        let mut fired = 0;

        loop {
            match self.heap.peek() {
                Some(entry) if entry.deadline <= now && entry.seq <= horizon => {}
                _ => break,
            }
            let Some(entry) = self.heap.pop() else { break };
            if entry.active.swap(false, AtomicOrdering::AcqRel) {
                (entry.callback)(state, self);
                fired += 1;
            }
        }
        fired
    }

    /// Heap slots in use, cancelled timers included
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<S> Default for TimerQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut queue: TimerQueue<Vec<u32>> = TimerQueue::new();
        let base = Instant::now();
        queue.schedule_at(base + Duration::from_millis(3), |log, _| log.push(3));
        queue.schedule_at(base + Duration::from_millis(1), |log, _| log.push(1));
        queue.schedule_at(base + Duration::from_millis(2), |log, _| log.push(2));
        queue.schedule_at(base + Duration::from_millis(2), |log, _| log.push(22));

        thread::sleep(Duration::from_millis(10));
        let mut log = Vec::new();
        assert_eq!(queue.fire_due(&mut log), 4);
        assert_eq!(log, vec![1, 2, 22, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancelled_timer_is_noop_but_occupies_slot() {
        let mut queue: TimerQueue<u32> = TimerQueue::new();
        let handle = queue.schedule(Duration::ZERO, |n, _| *n += 1);
        queue.cancel(&handle);
        assert!(!handle.is_active());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_wait(), Some(Duration::ZERO));

        let mut n = 0;
        assert_eq!(queue.fire_due(&mut n), 0);
        assert_eq!(n, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_next_wait() {
        let mut queue: TimerQueue<()> = TimerQueue::new();
        assert_eq!(queue.next_wait(), None);
        queue.schedule(Duration::from_secs(60), |_, _| {});
        let wait = queue.next_wait().unwrap();
        assert!(wait > Duration::from_secs(59));
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn test_rearm_waits_for_next_pass() {
        fn tick(n: &mut u32, queue: &mut TimerQueue<u32>) {
            *n += 1;
            queue.schedule(Duration::ZERO, tick);
        }

        let mut queue: TimerQueue<u32> = TimerQueue::new();
        queue.schedule(Duration::ZERO, tick);
        let mut n = 0;
        assert_eq!(queue.fire_due(&mut n), 1);
        assert_eq!(queue.fire_due(&mut n), 1);
        assert_eq!(n, 2);
        assert_eq!(queue.len(), 1);
    }
}
