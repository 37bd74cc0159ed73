//! Blocking FIFO work queues and wake signals.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::handler::StopFlag;

/// FIFO queue drained by a single consumer thread.
///
/// Items are pushed at the front and taken from the back.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    monitor: Condvar,
}

impl<T> WorkQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            monitor: Condvar::new(),
        }
    }

    /// Append an item and wake waiting consumers.
    pub fn push(&self, item: T) {
        self.items.lock().push_front(item);
        self.monitor.notify_all();
    }

    /// Append several items at once.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        let mut q = self.items.lock();
        for item in items {
            q.push_front(item);
        }
        drop(q);
        self.monitor.notify_all();
    }

    /// Take the oldest item without blocking.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Block until an item is available or `stop` is set.
    pub fn wait_pop(&self, stop: &StopFlag) -> Option<T> {
        let mut q = self.items.lock();
        loop {
            if stop.should_stop() {
                return None;
            }
            if let Some(item) = q.pop_back() {
                return Some(item);
            }
            self.monitor.wait(&mut q);
        }
    }

    /// Like [`WorkQueue::wait_pop`] but gives up after `timeout`.
    pub fn wait_pop_timeout(&self, stop: &StopFlag, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut q = self.items.lock();
        loop {
            if stop.should_stop() {
                return None;
            }
            if let Some(item) = q.pop_back() {
                return Some(item);
            }
            if self.monitor.wait_until(&mut q, deadline).timed_out() {
                return q.pop_back();
            }
        }
    }

    /// Wake every waiting consumer.
    pub fn wake_all(&self) {
        let _q = self.items.lock();
        self.monitor.notify_all();
    }

    /// Keep only the items matching `f`.
    pub fn retain(&self, f: impl FnMut(&T) -> bool) {
        self.items.lock().retain(f);
    }

    /// Remove and return every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut q = self.items.lock();
        q.drain(..).rev().collect()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Edge-triggered wake-up flag with a timed wait.
#[derive(Default)]
pub struct Signal {
    raised: Mutex<bool>,
    monitor: Condvar,
}

impl Signal {
    /// Create a lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake any waiter.
    pub fn raise(&self) {
        *self.raised.lock() = true;
        self.monitor.notify_all();
    }

    /// Wait until raised, stopped, or `timeout` elapses.
    ///
    /// Returns true if the signal was raised; it is lowered again.
    pub fn wait(&self, stop: &StopFlag, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.raised.lock();
        while !*raised && !stop.should_stop() {
            if self.monitor.wait_until(&mut raised, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *raised, false)
    }

    /// Wake waiters without raising the signal.
    pub fn wake(&self) {
        let _raised = self.raised.lock();
        self.monitor.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = WorkQueue::new();
        q.push(1);
        q.push(2);
        q.extend([3, 4]);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.drain(), vec![2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_wait_pop_stops() {
        let q: Arc<WorkQueue<u8>> = Arc::new(WorkQueue::new());
        let stop = StopFlag::new();
        let (q2, stop2) = (Arc::clone(&q), stop.clone());
        let t = thread::spawn(move || q2.wait_pop(&stop2));
        thread::sleep(Duration::from_millis(20));
        stop.stop();
        q.wake_all();
        assert_eq!(t.join().unwrap(), None);
    }

    #[test]
    fn test_wait_pop_timeout() {
        let q: WorkQueue<u8> = WorkQueue::new();
        let stop = StopFlag::new();
        let start = Instant::now();
        assert_eq!(q.wait_pop_timeout(&stop, Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_retain() {
        let q = WorkQueue::new();
        q.extend(1..=6);
        q.retain(|v| v % 2 == 0);
        assert_eq!(q.drain(), vec![2, 4, 6]);
    }

    #[test]
    fn test_signal() {
        let s = Arc::new(Signal::new());
        let stop = StopFlag::new();
        assert!(!s.wait(&stop, Duration::from_millis(10)));
        let s2 = Arc::clone(&s);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            s2.raise();
        });
        assert!(s.wait(&stop, Duration::from_secs(5)));
        t.join().unwrap();
    }
}
