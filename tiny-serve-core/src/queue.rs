//! Priority- and deadline-aware admission queue.
//!
//! A binary min-heap over a derived score, with lazy tombstone removal
//! through a side table and a periodic aging pass that bounds starvation.
//! All mutation is serialized by one coarse mutex; heap operations are
//! O(log n) and short, so finer locking buys nothing.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::request::{RequestId, SharedRequest};

/// Guard against division by a vanishing time-to-deadline.
const DEADLINE_EPSILON_SECS: f64 = 0.001;

/// Overdue deadlines sort ahead of everything, including `Critical`.
const OVERDUE_BOOST: f64 = 1e6;

/// Aging can lift an entry by at most one full priority level.
const MAX_AGING_BOOST: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue capacity {0} exceeded")]
    CapacityExceeded(usize),
}

/// Entry in the priority heap. Lower score dequeues first; ties break by
/// ascending sequence number (FIFO).
struct QueueEntry {
    score: f64,
    seq: u64,
    id: RequestId,
}

impl Eq for QueueEntry {}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.seq == other.seq
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the lowest score pops first
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    /// Side table mapping id -> live request. Heap entries whose id is
    /// absent here are tombstones, discarded lazily on pop.
    live: HashMap<RequestId, SharedRequest>,
    next_seq: u64,
}

/// Concurrency-safe admission queue holding `Waiting`/`Preempted` requests.
pub struct PriorityRequestQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: Option<usize>,
    max_age: Duration,
}

impl PriorityRequestQueue {
    pub fn new(capacity: Option<usize>, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                live: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            capacity,
            max_age,
        }
    }

    fn score(request: &SharedRequest, now: Instant, max_age: Duration) -> f64 {
        let req = request.read().expect("request lock poisoned");
        let base = f64::from(req.priority().ordinal());

        let deadline_boost = match req.deadline() {
            Some(deadline) if deadline <= now => OVERDUE_BOOST,
            Some(deadline) => {
                let ttd = deadline.duration_since(now).as_secs_f64();
                1.0 / ttd.max(DEADLINE_EPSILON_SECS)
            }
            None => 0.0,
        };

        let age = now.duration_since(req.arrival_time());
        let aging_boost = if age > max_age && max_age > Duration::ZERO {
            let overshoot = (age - max_age).as_secs_f64() / max_age.as_secs_f64();
            overshoot.min(MAX_AGING_BOOST)
        } else {
            0.0
        };

        base - deadline_boost - aging_boost
    }

    /// Insert a request. Never blocks; fails only when the configured
    /// capacity cap is hit. Re-pushing a request keeps the sequence number
    /// it was first assigned, which places a chunk remainder or a resumed
    /// request at the front of its priority class.
    pub fn push(&self, request: &SharedRequest) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        if let Some(cap) = self.capacity {
            // count live entries, not heap entries: tombstones don't occupy
            // capacity
            if inner.live.len() >= cap {
                return Err(QueueError::CapacityExceeded(cap));
            }
        }

        let seq = {
            let mut req = request.write().expect("request lock poisoned");
            match req.queue_seq {
                Some(seq) => seq,
                None => {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    req.queue_seq = Some(seq);
                    seq
                }
            }
        };

        let id = request.read().expect("request lock poisoned").id().clone();
        let score = Self::score(request, now, self.max_age);
        inner.heap.push(QueueEntry { score, seq, id: id.clone() });
        inner.live.insert(id, request.clone());
        drop(inner);

        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the lowest-score eligible entry, lazily skipping
    /// tombstones and requests no longer in a schedulable state.
    pub fn pop(&self) -> Option<SharedRequest> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        while let Some(entry) = inner.heap.pop() {
            let Some(request) = inner.live.get(&entry.id) else {
                continue;
            };
            let eligible = request
                .read()
                .expect("request lock poisoned")
                .state()
                .is_schedulable();
            let request = inner.live.remove(&entry.id).expect("checked above");
            if eligible {
                return Some(request);
            }
        }
        None
    }

    /// Read-only equivalent of [`pop`](Self::pop). Tombstones encountered at
    /// the root are pruned.
    pub fn peek(&self) -> Option<SharedRequest> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        loop {
            let id = inner.heap.peek()?.id.clone();
            let live = match inner.live.get(&id) {
                Some(request) => request
                    .read()
                    .expect("request lock poisoned")
                    .state()
                    .is_schedulable(),
                None => false,
            };
            if live {
                return inner.live.get(&id).cloned();
            }
            inner.heap.pop();
            inner.live.remove(&id);
        }
    }

    /// Lazy O(1) removal via the side table. Subsequent `pop`s can never
    /// return the removed request even while its heap entry still exists.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.live.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every eligible entry whose deadline falls before
    /// `horizon`. Used by deadline-override admission.
    pub fn pop_due(&self, horizon: Instant) -> Vec<SharedRequest> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let due_ids: Vec<RequestId> = inner
            .live
            .iter()
            .filter(|(_, request)| {
                let req = request.read().expect("request lock poisoned");
                req.state().is_schedulable()
                    && req.deadline().is_some_and(|d| d <= horizon)
            })
            .map(|(id, _)| id.clone())
            .collect();

        due_ids
            .iter()
            .filter_map(|id| inner.live.remove(id))
            .collect()
    }

    /// Eligible queued requests carrying a deadline. Used for
    /// deadline-unreachable accounting.
    pub fn deadline_waiters(&self) -> Vec<SharedRequest> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .live
            .values()
            .filter(|request| {
                let req = request.read().expect("request lock poisoned");
                req.state().is_schedulable() && req.deadline().is_some()
            })
            .cloned()
            .collect()
    }

    /// Starvation-prevention pass: recompute every live entry's score from
    /// its absolute age and rebuild the heap. Scores are a pure function of
    /// `now` and the request, so repeated passes on an unchanged queue are
    /// stable and non-oscillating.
    pub fn age_requests(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let mut rebuilt = BinaryHeap::with_capacity(inner.live.len());
        let entries: Vec<QueueEntry> = inner.heap.drain().collect();
        for entry in entries {
            let Some(request) = inner.live.get(&entry.id) else {
                // tombstone, drop it during the rebuild
                continue;
            };
            let score = Self::score(request, now, self.max_age);
            rebuilt.push(QueueEntry { score, seq: entry.seq, id: entry.id });
        }
        inner.heap = rebuilt;
    }

    /// Await the next push. Callers that poll instead can ignore this.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
