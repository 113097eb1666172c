//! Byte-weighted work queue with watermark callbacks.
//!
//! The send pipeline sits behind one of these: a FIFO of
//! `(item, byte_weight)` pairs that tracks item count and cumulative byte
//! size, optionally bounded, with ordered high/low watermark callbacks used
//! to move the generator's send level as the queue fills and drains.
//!
//! # Watermark semantics
//! High and low watermark lists are kept sorted and deduplicated by byte
//! threshold. Two cursors remember the last-crossed high and low indices
//! (both start at -1). An enqueue fires every next-high threshold that the
//! new byte size has reached, in ascending order; a dequeue fires next-low
//! thresholds downward. Firing a high at index `i` moves the cursors to
//! `(i, i + 1)`; firing a low at index `j` moves them to `(j - 1, j)`, so a
//! queue oscillating around one threshold does not re-fire it.
//!
//! # Runner
//! A dequeuer task drains the queue through [`WorkQueue::run`], gated by a
//! pluggable start predicate (used to pause transmission while no session
//! is established, without blocking enqueue). The runner processes at most
//! 16 items between yields.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Items processed per runner cycle before yielding to the scheduler.
const MAX_WORK_LOAD: usize = 16;

// ---------------------------------------------------------------------------
// WaterMark
// ---------------------------------------------------------------------------

type WaterMarkCb = Arc<dyn Fn(u64) + Send + Sync>;
type StartRunnerFn = Box<dyn Fn() -> bool + Send + Sync>;

/// A byte threshold paired with the callback fired when it is crossed.
#[derive(Clone)]
pub struct WaterMark {
    pub bytes: u64,
    pub callback: WaterMarkCb,
}

impl WaterMark {
    pub fn new(bytes: u64, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        WaterMark {
            bytes,
            callback: Arc::new(callback),
        }
    }
}

impl std::fmt::Debug for WaterMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaterMark").field("bytes", &self.bytes).finish()
    }
}

// ---------------------------------------------------------------------------
// Queue internals
// ---------------------------------------------------------------------------

struct Inner<T> {
    queue: VecDeque<(T, u64)>,
    bytes: u64,
    bound: Option<u64>,
    num_enqueues: u64,
    num_dequeues: u64,
    drops: u64,
    enqueued_bytes: u64,
    dequeued_bytes: u64,
    high_watermarks: Vec<WaterMark>,
    low_watermarks: Vec<WaterMark>,
    hwm_index: i32,
    lwm_index: i32,
    runner_running: bool,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Inner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("queue", &self.queue)
            .field("bytes", &self.bytes)
            .field("bound", &self.bound)
            .field("num_enqueues", &self.num_enqueues)
            .field("num_dequeues", &self.num_dequeues)
            .field("drops", &self.drops)
            .field("enqueued_bytes", &self.enqueued_bytes)
            .field("dequeued_bytes", &self.dequeued_bytes)
            .field("high_watermarks", &self.high_watermarks)
            .field("low_watermarks", &self.low_watermarks)
            .field("hwm_index", &self.hwm_index)
            .field("lwm_index", &self.lwm_index)
            .field("runner_running", &self.runner_running)
            .finish()
    }
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Inner {
            queue: VecDeque::new(),
            bytes: 0,
            bound: None,
            num_enqueues: 0,
            num_dequeues: 0,
            drops: 0,
            enqueued_bytes: 0,
            dequeued_bytes: 0,
            high_watermarks: Vec::new(),
            low_watermarks: Vec::new(),
            hwm_index: -1,
            lwm_index: -1,
            runner_running: false,
        }
    }
}

/// Counters snapshot for introspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub len: usize,
    pub bytes: u64,
    pub num_enqueues: u64,
    pub num_dequeues: u64,
    pub drops: u64,
    pub enqueued_bytes: u64,
    pub dequeued_bytes: u64,
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    start_runner: Mutex<Option<StartRunnerFn>>,
    notify: Notify,
}

impl<T: std::fmt::Debug> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("inner", &self.inner)
            .field("notify", &self.notify)
            .finish_non_exhaustive()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        WorkQueue {
            inner: Mutex::new(Inner::default()),
            start_runner: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue::default()
    }

    /// Replace the start-runner predicate. `None` means "always run".
    pub fn set_start_runner(&self, predicate: Option<StartRunnerFn>) {
        *self.start_runner.lock().expect("queue predicate lock") = predicate;
    }

    /// Bound the queue to `max_bytes`; enqueues past the cap are rejected.
    pub fn set_bound(&self, max_bytes: Option<u64>) {
        self.inner.lock().expect("queue lock").bound = max_bytes;
    }

    pub fn bounded(&self) -> bool {
        self.inner.lock().expect("queue lock").bound.is_some()
    }

    /// Install the high watermark list (sorted, deduplicated by threshold).
    pub fn set_high_watermarks(&self, mut marks: Vec<WaterMark>) {
        marks.sort_by_key(|m| m.bytes);
        marks.dedup_by_key(|m| m.bytes);
        self.inner.lock().expect("queue lock").high_watermarks = marks;
    }

    /// Install the low watermark list (sorted, deduplicated by threshold).
    pub fn set_low_watermarks(&self, mut marks: Vec<WaterMark>) {
        marks.sort_by_key(|m| m.bytes);
        marks.dedup_by_key(|m| m.bytes);
        self.inner.lock().expect("queue lock").low_watermarks = marks;
    }

    /// `(last-crossed-high, last-crossed-low)` indices; `(-1, -1)` initially.
    pub fn watermark_indices(&self) -> (i32, i32) {
        let inner = self.inner.lock().expect("queue lock");
        (inner.hwm_index, inner.lwm_index)
    }

    /// Enqueue `item` with its byte weight. Returns false (counting a drop)
    /// when the queue is bounded and the cap would be exceeded.
    pub fn enqueue(&self, item: T, weight: u64) -> bool {
        let fired = {
            let mut inner = self.inner.lock().expect("queue lock");
            if let Some(cap) = inner.bound {
                if inner.bytes + weight > cap {
                    inner.drops += 1;
                    return false;
                }
            }
            inner.queue.push_back((item, weight));
            inner.bytes += weight;
            inner.num_enqueues += 1;
            inner.enqueued_bytes += weight;

            // Walk every next-high threshold the new size has reached.
            let mut fired: Vec<(WaterMarkCb, u64)> = Vec::new();
            loop {
                let next = inner.hwm_index + 1;
                let Some(mark) = inner.high_watermarks.get(next as usize) else {
                    break;
                };
                if inner.bytes >= mark.bytes {
                    fired.push((mark.callback.clone(), inner.bytes));
                    inner.hwm_index = next;
                    inner.lwm_index = next + 1;
                } else {
                    break;
                }
            }
            fired
        };
        // Callbacks run on the posting task, outside the queue lock.
        for (callback, qsize) in fired {
            callback(qsize);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue the oldest item, firing any low watermarks crossed downward.
    pub fn dequeue(&self) -> Option<T> {
        let (item, fired) = {
            let mut inner = self.inner.lock().expect("queue lock");
            let (item, weight) = inner.queue.pop_front()?;
            inner.bytes -= weight;
            inner.num_dequeues += 1;
            inner.dequeued_bytes += weight;

            let mut fired: Vec<(WaterMarkCb, u64)> = Vec::new();
            loop {
                let next = inner.lwm_index - 1;
                if next < 0 {
                    break;
                }
                let Some(mark) = inner.low_watermarks.get(next as usize) else {
                    break;
                };
                if inner.bytes <= mark.bytes {
                    fired.push((mark.callback.clone(), inner.bytes));
                    inner.lwm_index = next;
                    inner.hwm_index = next - 1;
                } else {
                    break;
                }
            }
            (item, fired)
        };
        for (callback, qsize) in fired {
            callback(qsize);
        }
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("queue lock").queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").queue.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().expect("queue lock").bytes
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock");
        QueueStats {
            len: inner.queue.len(),
            bytes: inner.bytes,
            num_enqueues: inner.num_enqueues,
            num_dequeues: inner.num_dequeues,
            drops: inner.drops,
            enqueued_bytes: inner.enqueued_bytes,
            dequeued_bytes: inner.dequeued_bytes,
        }
    }

    /// Wake the runner so it re-evaluates the start predicate (used after
    /// re-enabling the send queue).
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// Drop all queued items (session teardown).
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("queue lock");
        while let Some((_, weight)) = inner.queue.pop_front() {
            inner.bytes -= weight;
            inner.num_dequeues += 1;
            inner.dequeued_bytes += weight;
        }
    }

    fn start_allowed(&self) -> bool {
        self.start_runner
            .lock()
            .expect("queue predicate lock")
            .as_ref()
            .is_none_or(|predicate| predicate())
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// The dequeuer loop. Drains batches of up to 16 items through `worker`,
    /// yielding between batches, parking whenever the queue is empty or the
    /// start predicate says not to run. Runs until the owner drops the queue
    /// handle and aborts the task.
    pub async fn run<F, Fut>(self: Arc<Self>, mut worker: F)
    where
        F: FnMut(T) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        loop {
            if !self.start_allowed() {
                self.notify.notified().await;
                continue;
            }
            {
                let mut inner = self.inner.lock().expect("queue lock");
                inner.runner_running = true;
            }
            let mut processed = 0;
            while processed < MAX_WORK_LOAD {
                if !self.start_allowed() {
                    break;
                }
                match self.dequeue() {
                    Some(item) => {
                        worker(item).await;
                        processed += 1;
                    }
                    None => break,
                }
            }
            if self.is_empty() || !self.start_allowed() {
                {
                    let mut inner = self.inner.lock().expect("queue lock");
                    inner.runner_running = false;
                }
                self.notify.notified().await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn runner_running(&self) -> bool {
        self.inner.lock().expect("queue lock").runner_running
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
