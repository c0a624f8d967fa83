use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Outcome of [`HandoffQueue::pop_wait`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    /// The head of the queue, removed.
    Item(T),
    /// Nothing arrived within the timeout. The queue is unchanged.
    TimedOut,
    /// The queue was closed and is drained.
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    capacity: Option<usize>,
}

/// FIFO hand-off between one producer stage and one consumer stage.
///
/// `pop_wait` blocks on a condition variable until an item arrives, the queue
/// is closed, or the timeout elapses. A bounded queue never blocks the
/// producer: pushing into a full queue evicts the oldest item and hands it
/// back to the caller.
pub struct HandoffQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> HandoffQueue<T> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    /// `0` means unbounded.
    pub fn from_config(capacity: usize) -> Self {
        if capacity == 0 {
            Self::unbounded()
        } else {
            Self::bounded(capacity)
        }
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                }),
                available: Condvar::new(),
                capacity,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // No operation leaves the deque half-modified, so poisoning is ignored.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` and wake one waiting consumer.
    ///
    /// Returns the evicted oldest item when a bounded queue was full. Pushing
    /// into a closed queue hands `item` straight back.
    pub fn push(&self, item: T) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return Some(item);
        }
        let evicted = match self.inner.capacity {
            Some(cap) if state.items.len() >= cap => state.items.pop_front(),
            _ => None,
        };
        state.items.push_back(item);
        drop(state);
        self.inner.available.notify_one();
        evicted
    }

    /// Remove the head, waiting up to `timeout` for one to arrive.
    pub fn pop_wait(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Pop::Item(item);
            }
            if state.closed {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::TimedOut;
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Remove the head without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Refuse further pushes and wake every waiter. Items already queued can
    /// still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn preserves_fifo_order() {
        let queue = HandoffQueue::unbounded();
        for i in 0..100 {
            assert!(queue.push(i).is_none());
        }
        for i in 0..100 {
            assert_eq!(queue.pop_wait(Duration::from_millis(10)), Pop::Item(i));
        }
    }

    #[test]
    fn fifo_across_threads() {
        let queue = HandoffQueue::unbounded();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..1000u32 {
                    queue.push(i);
                }
                queue.close();
            })
        };
        let mut received = Vec::new();
        loop {
            match queue.pop_wait(Duration::from_secs(5)) {
                Pop::Item(i) => received.push(i),
                Pop::Closed => break,
                Pop::TimedOut => panic!("producer stalled"),
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn empty_pop_times_out_within_bound() {
        let queue: HandoffQueue<u8> = HandoffQueue::unbounded();
        let start = Instant::now();
        assert_eq!(queue.pop_wait(Duration::from_millis(50)), Pop::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "waited {elapsed:?}");
        assert!(queue.is_empty(), "timeout leaves the queue unchanged");
    }

    #[test]
    fn waiting_consumer_is_woken_by_push() {
        let queue = HandoffQueue::unbounded();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push("frame");
        assert_eq!(consumer.join().unwrap(), Pop::Item("frame"));
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let queue = HandoffQueue::unbounded();
        queue.push(1);
        queue.push(2);
        queue.close();
        assert_eq!(queue.push(3), Some(3), "closed queue refuses pushes");
        assert_eq!(queue.pop_wait(Duration::ZERO), Pop::Item(1));
        assert_eq!(queue.pop_wait(Duration::ZERO), Pop::Item(2));
        let start = Instant::now();
        assert_eq!(queue.pop_wait(Duration::from_secs(5)), Pop::Closed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue: HandoffQueue<u8> = HandoffQueue::unbounded();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_wait(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), Pop::Closed);
    }

    #[test]
    fn bounded_queue_drops_oldest() {
        let queue = HandoffQueue::bounded(2);
        assert_eq!(queue.push('a'), None);
        assert_eq!(queue.push('b'), None);
        assert_eq!(queue.push('c'), Some('a'));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some('b'));
        assert_eq!(queue.try_pop(), Some('c'));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn each_item_goes_to_exactly_one_consumer() {
        let queue = HandoffQueue::unbounded();
        for i in 0..200u32 {
            queue.push(i);
        }
        queue.close();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Pop::Item(i) = queue.pop_wait(Duration::from_millis(100)) {
                        got.push(i);
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<u32> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }
}
