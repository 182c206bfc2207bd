//! A named affinity group: a contiguous range of workers, a priority, a
//! per-worker queue for each worker in the range, and an overflow mailbox.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::mailbox::{Mailbox, MailboxSender};
use crate::queue::{steal_one, TaskQueue};
use crate::work_item::WorkItem;

/// A declared workgroup: `[start, start + count)` worker indices, a
/// priority used only to order traversal during the find-work sweep (see
/// `scheduler.rs`), one [`TaskQueue`] per worker in the range, and an
/// unbounded overflow [`Mailbox`].
pub struct Workgroup {
    id: u32,
    start_worker: u32,
    worker_count: u32,
    priority: i32,
    queues: Vec<TaskQueue>,
    mailbox_tx: MailboxSender<WorkItem>,
    mailbox: Mailbox<WorkItem>,
    /// Incremented on every successful submission, decremented after a
    /// task finishes executing. See `sink_one_work`.
    pending: AtomicI64,
}

impl Workgroup {
    pub fn new(id: u32, start_worker: u32, worker_count: u32, priority: i32) -> Self {
        let queues = (0..worker_count).map(|_| TaskQueue::new()).collect();
        let (mailbox_tx, mailbox) = Mailbox::unbounded();
        Self {
            id,
            start_worker,
            worker_count,
            priority,
            queues,
            mailbox_tx,
            mailbox,
            pending: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start_worker(&self) -> u32 {
        self.start_worker
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn end_worker(&self) -> u32 {
        self.start_worker + self.worker_count
    }

    pub fn contains_worker(&self, worker_id: u32) -> bool {
        worker_id >= self.start_worker && worker_id < self.end_worker()
    }

    /// Try to place `work` directly into worker `offset`'s queue.
    /// `offset` is relative to `start_worker`. Always succeeds — the
    /// underlying deque grows — but the name and increment-on-success
    /// shape mirror the distilled spec's bounded-queue contract for
    /// callers that want to treat it as fallible in a future bounded
    /// implementation.
    pub fn push_to_worker(&self, offset: u32, work: WorkItem) -> bool {
        match self.queues.get(offset as usize) {
            Some(q) => {
                q.push(work);
                self.pending.fetch_add(1, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Route `work` to the overflow mailbox. Used only after per-worker
    /// queues have refused a submission for the submitter's retry budget.
    pub fn submit_to_mailbox(&self, work: WorkItem) {
        // An unbounded mailbox send only fails if every receiver has been
        // dropped, which cannot happen while `self` (which owns the
        // receiving half) is alive.
        let _ = self.mailbox_tx.send(work);
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Owner-only pop from worker `offset`'s local queue. Does not touch
    /// the pending counter — see `sink_one_work`.
    pub fn pop_from_worker(&self, offset: u32) -> Option<WorkItem> {
        self.queues.get(offset as usize).and_then(|q| q.pop_owner())
    }

    /// Attempt to steal one item from a sibling worker, starting at
    /// `random_victim_hint` and probing every other offset in the group.
    /// Does not touch the pending counter.
    pub fn steal(&self, own_offset: u32, random_victim_hint: u32) -> Option<WorkItem> {
        let n = self.worker_count;
        if n == 0 {
            return None;
        }
        let start = random_victim_hint % n;
        for probe in 0..n {
            let offset = (start + probe) % n;
            if offset == own_offset {
                continue;
            }
            if let Some(q) = self.queues.get(offset as usize) {
                if let Some(item) = steal_one(&q.stealer()) {
                    return Some(item);
                }
            }
        }
        None
    }

    /// Pop from the overflow mailbox. Does not touch the pending counter.
    pub fn receive_from_mailbox(&self) -> Option<WorkItem> {
        self.mailbox.recv()
    }

    /// Decrement the pending-work counter. Must be called exactly once per
    /// submission, after the corresponding task finishes executing (not at
    /// pop/steal/mailbox-receive time).
    pub fn sink_one_work(&self) {
        self.pending.fetch_sub(1, Ordering::Release);
    }

    /// Weak (relaxed) check: is there possibly work anywhere in this
    /// group? Used by the worker's cheap "should I even look here" probe.
    pub fn has_work(&self) -> bool {
        self.pending.load(Ordering::Relaxed) > 0
    }

    /// Strong (acquire) check used by `wait_for_tasks`: observes the
    /// pending counter with acquire ordering so it synchronizes with the
    /// release in `sink_one_work`.
    pub fn has_work_strong(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// Current pending-work count (submitted minus completed). Exposed
    /// for tests asserting the accounting invariant in §8 of
    /// `SPEC_FULL.md`.
    pub fn pending_count(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// A stealer handle for a given worker offset, used by the scheduler
    /// to let a worker probe a sibling's queue length as a victim
    /// heuristic without going through `steal`.
    pub fn queue_len(&self, offset: u32) -> usize {
        self.queues.get(offset as usize).map_or(0, TaskQueue::len)
    }
}

impl std::fmt::Debug for Workgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workgroup")
            .field("id", &self.id)
            .field("start_worker", &self.start_worker)
            .field("worker_count", &self.worker_count)
            .field("priority", &self.priority)
            .field("pending", &self.pending_count())
            .finish()
    }
}
