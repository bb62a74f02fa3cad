//! Deduplicating, rate-limited work queue.
//!
//! Holds at most one pending event per key and never hands out a key that is
//! already being processed. A key added while in flight is marked dirty and
//! goes back on the queue when the worker calls [`WorkQueue::done`].
//!
//! Delayed adds sit in a min-heap. There is no timer task: whichever
//! [`WorkQueue::get`] caller is idle sleeps until the earliest deadline and
//! promotes due entries, so shutting down simply abandons the heap.

pub mod retry;

pub use retry::{RetryDecision, RetryPolicy};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::model::Event;

/// Upper bound on any scheduled delay, about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, clamped so oversized delays cannot overflow `Instant`.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    Instant::now() + delay.min(FAR_FUTURE)
}

/// A delayed add waiting for its deadline.
#[derive(Debug)]
struct Delayed {
    deadline: Instant,
    event: Event,
}

#[derive(Debug, Default)]
struct Inner {
    /// Ready keys in first-add order.
    queue: VecDeque<String>,
    /// Pending payload per key. A key here is either in `queue` or in flight.
    dirty: HashMap<String, Event>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    /// Live deadline per key. Heap entries that disagree with it are stale.
    waiting: HashMap<String, Delayed>,
    timers: BinaryHeap<Reverse<(Instant, String)>>,
    /// Consecutive failures per key.
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl Inner {
    /// Returns true if a new key became ready.
    fn insert(&mut self, event: Event) -> bool {
        if self.shutting_down {
            return false;
        }
        let key = event.key.clone();
        if self.dirty.insert(key.clone(), event).is_some() {
            trace!(%key, "coalesced with pending event");
            return false;
        }
        if self.processing.contains(&key) {
            trace!(%key, "in flight, will requeue on done");
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let mut added = false;
        while matches!(self.timers.peek(), Some(Reverse((deadline, _))) if *deadline <= now) {
            let Some(Reverse((deadline, key))) = self.timers.pop() else {
                break;
            };
            let live = self
                .waiting
                .get(&key)
                .is_some_and(|d| d.deadline == deadline);
            if !live {
                continue;
            }
            if let Some(delayed) = self.waiting.remove(&key) {
                added |= self.insert(delayed.event);
            }
        }
        added
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((deadline, _))| *deadline)
    }
}

/// Work queue shared by the event source and the worker pool.
#[derive(Debug)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    policy: RetryPolicy,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl WorkQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves `Inner` consistent, so a poisoned
        // lock is still safe to use.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `event` unless its key is already pending.
    ///
    /// A pending key keeps its queue position but takes the newer payload.
    /// An in-flight key is requeued once its worker calls [`done`](Self::done).
    /// No-op after shutdown.
    pub fn add(&self, event: Event) {
        let added = self.lock().insert(event);
        if added {
            self.notify.notify_one();
        }
    }

    /// Queue `event` once `delay` has elapsed.
    ///
    /// Repeated delayed adds for one key keep the earliest deadline and the
    /// newest payload.
    pub fn add_after(&self, event: Event, delay: Duration) {
        if delay.is_zero() {
            self.add(event);
            return;
        }
        let deadline = deadline_after(delay);
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            let key = event.key.clone();
            match inner.waiting.get_mut(&key) {
                Some(existing) if existing.deadline <= deadline => {
                    existing.event = event;
                    return;
                }
                Some(existing) => {
                    existing.deadline = deadline;
                    existing.event = event;
                }
                None => {
                    inner.waiting.insert(key.clone(), Delayed { deadline, event });
                }
            }
            debug!(%key, delay_ms = delay.as_millis() as u64, "scheduled delayed add");
            inner.timers.push(Reverse((deadline, key)));
        }
        // An idle getter may be sleeping towards a later deadline.
        self.notify.notify_one();
    }

    /// Requeue `event` after its key's backoff, counting one more failure.
    ///
    /// Returns the delay used.
    pub fn add_rate_limited(&self, event: Event) -> Duration {
        let delay = {
            let mut inner = self.lock();
            let failures = inner.failures.entry(event.key.clone()).or_insert(0);
            let delay = self.policy.backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(event, delay);
        delay
    }

    /// Wait for the next ready event and mark its key in flight.
    ///
    /// Returns `None` once the queue is shutting down. Items still pending at
    /// that point are not handed out.
    pub async fn get(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                inner.promote_due(Instant::now());
                while let Some(key) = inner.queue.pop_front() {
                    let Some(event) = inner.dirty.remove(&key) else {
                        continue;
                    };
                    inner.processing.insert(key);
                    let more = !inner.queue.is_empty() || !inner.timers.is_empty();
                    drop(inner);
                    // Hand remaining work and timer duty to another getter.
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(event);
                }
                inner.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release the in-flight mark on `key`.
    ///
    /// If the key was added again while in flight it becomes ready now.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut inner = self.lock();
            inner.processing.remove(key);
            if !inner.shutting_down && inner.dirty.contains_key(key) {
                inner.queue.push_back(key.to_owned());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting on a delayed add.
    pub fn num_delayed(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Number of keys currently in flight.
    pub fn num_processing(&self) -> usize {
        self.lock().processing.len()
    }

    /// True when nothing is ready, delayed, or in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.queue.is_empty() && inner.waiting.is_empty() && inner.processing.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop handing out work. Idempotent.
    ///
    /// Every blocked and future [`get`](Self::get) returns `None`; pending
    /// delayed adds are dropped and later adds are ignored.
    pub fn shut_down(&self) {
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            inner.waiting.clear();
            inner.timers.clear();
        }
        debug!("work queue shutting down");
        self.notify.notify_waiters();
    }
}
