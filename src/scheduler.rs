//! Fixed-pool work-stealing scheduler with priority-ordered workgroups.
//!
//! The scheduler owns an array of OS worker threads and an array of up to
//! 32 [`Workgroup`]s declared before [`Scheduler::begin_execution`]. Each
//! worker runs a find-and-execute loop:
//!
//! 1. Pop from its own queue in its own (highest-priority) workgroup.
//! 2. Steal from siblings within that workgroup.
//! 3. Drain that workgroup's overflow mailbox.
//! 4. Repeat for every other workgroup the worker belongs to, in priority
//!    order. The traversal order is a fixed per-worker priority list
//!    computed once at startup rather than a dynamic occupancy check, which
//!    keeps the hot loop allocation-free at the cost of not rebalancing if
//!    group priorities could change at runtime (they can't here).
//!
//! When no task is found anywhere, the worker marks itself parked and blocks
//! on its own wake token; `submit` releases the token of whichever worker it
//! just pushed work onto. Tokens are per-worker rather than a shared pool so
//! a wake can never be consumed by an unrelated worker from a different,
//! non-overlapping workgroup. Worker 0 is the thread that called
//! `begin_execution` and has no spawned OS thread of its own — it is driven
//! cooperatively whenever it calls `wait_for_tasks` or `busy_work`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tracing::{debug, error, trace, warn};

use crate::error::{Result, SchedulerError};
use crate::sync::Semaphore;
use crate::task_context::{self, TaskContext};
use crate::work_item::WorkItem;
use crate::workgroup::Workgroup;

const MAX_GROUPS: usize = 32;

/// Multiplier applied to a group's worker count to get a default logical
/// task divisor, mirroring the source scheduler's own `work_scale`.
const WORK_SCALE: u32 = 4;

/// A worker's fixed traversal order: the groups it belongs to, stable-
/// sorted by descending priority then ascending group index, computed
/// once at `begin_execution`.
struct PriorityEntry {
    group_index: usize,
    offset: u32,
}

struct WorkerState {
    /// Per-worker failure counter used by the backoff policy: decays to
    /// zero on any successful execution, otherwise grows until it crosses
    /// the yield/park thresholds.
    failure_streak: AtomicU32,
    /// Set while this worker is parked on `park`, used by `submit`'s pass-1
    /// probe to prefer pushing into a worker it believes is idle. Purely a
    /// heuristic: `park` itself is released unconditionally on every push
    /// (see `Scheduler::wake_worker`), so a stale read here never causes a
    /// missed wakeup, only a worse choice of which sibling to prefer.
    sleeping: AtomicBool,
    /// This worker's own wake-token pool. Per-worker rather than a single
    /// scheduler-wide pool: a shared pool can release a token that a
    /// condvar hands to an unrelated worker from a different, non-
    /// overlapping workgroup, leaving the worker that actually received the
    /// new work parked indefinitely. Keying the wake on the exact worker a
    /// submission pushed into guarantees it is the one woken.
    park: Semaphore,
}

/// Declares a workgroup's layout before the scheduler starts running.
#[derive(Clone, Copy, Debug)]
struct GroupSpec {
    group_id: u32,
    start_worker: u32,
    worker_count: u32,
    priority: i32,
}

/// Builder-style configuration, declared and consumed before
/// `begin_execution`. Mirrors the shape of the teacher's
/// `TaskPoolBuilder`, adapted to this crate's create-groups-then-start
/// lifecycle.
#[derive(Default)]
pub struct SchedulerBuilder {
    specs: Vec<GroupSpec>,
    thread_name_prefix: Option<String>,
    stack_size: Option<usize>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Declare a workgroup occupying `[start_worker, start_worker +
    /// worker_count)`. Must be called before [`SchedulerBuilder::build`].
    pub fn create_group(
        mut self,
        group_id: u32,
        start_worker: u32,
        worker_count: u32,
        priority: i32,
    ) -> Result<Self> {
        if self.specs.len() >= MAX_GROUPS {
            return Err(SchedulerError::TooManyGroups {
                max: MAX_GROUPS as u32,
            });
        }
        if self.specs.iter().any(|s| s.group_id == group_id) {
            return Err(SchedulerError::DuplicateGroup { group: group_id });
        }
        debug!(group_id, start_worker, worker_count, priority, "workgroup declared");
        self.specs.push(GroupSpec {
            group_id,
            start_worker,
            worker_count,
            priority,
        });
        Ok(self)
    }

    /// Declare a single workgroup spanning every worker, sized to the
    /// detected hardware concurrency. Convenience for embedders that don't
    /// need more than one priority tier.
    pub fn create_default_group(self) -> Result<Self> {
        let worker_count = num_cpus::get().max(1) as u32;
        self.create_group(0, 0, worker_count, 0)
    }

    /// Finalize the configuration into an [`Arc`]-wrapped [`Scheduler`],
    /// ready for [`Scheduler::begin_execution`]. Returned pre-wrapped in
    /// `Arc` (rather than a bare `Scheduler`) because the scheduler keeps a
    /// [`Weak`] back-reference to itself, established via
    /// [`Arc::new_cyclic`], so worker threads can be handed their own owning
    /// `Arc<Scheduler>` clone from inside `&self` methods.
    pub fn build(self) -> Result<Arc<Scheduler>> {
        let worker_count = self
            .specs
            .iter()
            .map(|s| s.start_worker + s.worker_count)
            .max()
            .unwrap_or(1)
            .max(1);

        for s in &self.specs {
            let end = s.start_worker + s.worker_count;
            if end > worker_count {
                return Err(SchedulerError::GroupOutOfRange {
                    group: s.group_id,
                    start: s.start_worker,
                    end,
                    worker_count,
                });
            }
        }

        let priority_lists = build_priority_lists(&self.specs, worker_count);

        let mut groups: Vec<Workgroup> = self
            .specs
            .iter()
            .map(|s| Workgroup::new(s.group_id, s.start_worker, s.worker_count, s.priority))
            .collect();
        groups.sort_by_key(|g| g.id());

        let thread_name_prefix = self.thread_name_prefix.unwrap_or_else(|| "worker".into());
        let stack_size = self.stack_size;

        Ok(Arc::new_cyclic(|weak_self| Scheduler {
            worker_count,
            groups,
            thread_name_prefix,
            stack_size,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            worker_states: (0..worker_count)
                .map(|_| WorkerState {
                    failure_streak: AtomicU32::new(0),
                    sleeping: AtomicBool::new(false),
                    park: Semaphore::new(0),
                })
                .collect(),
            priority_lists,
            weak_self: weak_self.clone(),
        }))
    }
}

/// For every worker, the list of (group_index, offset) pairs for every
/// group that contains it, stable-sorted by descending priority then
/// ascending group index — the "v1" fixed priority traversal. `group_index`
/// indexes into `specs` here but is re-resolved against the id-sorted
/// `groups` vec built by `build_priority_lists`'s caller; to keep the
/// index meaning stable we sort `specs` itself, not the resulting `groups`
/// array, by id first.
fn build_priority_lists(specs: &[GroupSpec], worker_count: u32) -> Vec<Vec<PriorityEntry>> {
    let mut by_id: Vec<GroupSpec> = specs.to_vec();
    by_id.sort_by_key(|s| s.group_id);

    let mut ordered: Vec<(usize, &GroupSpec)> = by_id.iter().enumerate().collect();
    ordered.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.0.cmp(&b.0)));

    let mut lists: Vec<Vec<PriorityEntry>> = (0..worker_count).map(|_| Vec::new()).collect();
    for worker_id in 0..worker_count {
        for (group_index, spec) in &ordered {
            if worker_id >= spec.start_worker && worker_id < spec.start_worker + spec.worker_count
            {
                lists[worker_id as usize].push(PriorityEntry {
                    group_index: *group_index,
                    offset: worker_id - spec.start_worker,
                });
            }
        }
    }
    lists
}

/// Deterministic per-thread xorshift32, used only to pick a steal-victim
/// starting offset — no cryptographic property is required.
fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

thread_local! {
    static RNG_STATE: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

fn next_rand(worker_id: u32) -> u32 {
    RNG_STATE.with(|cell| {
        let mut state = cell.get();
        if state == 0 {
            state = worker_id.wrapping_mul(2654435761).max(1);
        }
        let r = xorshift32(&mut state);
        cell.set(state);
        r
    })
}

/// The scheduler runtime: owns workgroups, worker threads, and wake
/// primitives.
pub struct Scheduler {
    worker_count: u32,
    groups: Vec<Workgroup>,
    thread_name_prefix: String,
    stack_size: Option<usize>,
    running: AtomicBool,
    stopping: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_states: Vec<WorkerState>,
    priority_lists: Vec<Vec<PriorityEntry>>,
    /// Back-reference to the `Arc` that owns this scheduler, established by
    /// `Arc::new_cyclic` in `SchedulerBuilder::build`. Lets `&self` methods
    /// (`begin_execution`, `take_ownership`, `run_worker`) hand out fresh
    /// owning `Arc<Scheduler>` clones to spawned worker threads without
    /// requiring an `Arc<Self>` receiver, which stable Rust does not support
    /// by reference.
    weak_self: Weak<Scheduler>,
}

/// Spin/yield/park thresholds for the backoff policy (§4.4).
const SPIN_THRESHOLD: u32 = 64;
const YIELD_THRESHOLD: u32 = 512;

impl Scheduler {
    /// Begin a builder for a new scheduler.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Sum of every group's pending-work counter. Zero iff
    /// `wait_for_tasks` would return immediately; exposed for tests
    /// asserting the accounting invariant in §8 of `SPEC_FULL.md`.
    pub fn total_pending(&self) -> i64 {
        self.groups.iter().map(Workgroup::pending_count).sum()
    }

    fn group_by_id(&self, group_id: u32) -> Option<&Workgroup> {
        self.groups.iter().find(|g| g.id() == group_id)
    }

    /// Number of workers in `group`. Used by `parallel_for` to compute
    /// initial split divisors.
    pub fn get_worker_count(&self, group_id: u32) -> u32 {
        self.group_by_id(group_id).map_or(1, Workgroup::worker_count)
    }

    /// First worker index belonging to `group`.
    pub fn get_worker_start_idx(&self, group_id: u32) -> u32 {
        self.group_by_id(group_id).map_or(0, Workgroup::start_worker)
    }

    /// A logical divisor hint: the group's worker count scaled by
    /// [`WORK_SCALE`], giving callers outside `parallel_for.rs` (which
    /// computes its own grain-size-aware divisor via the `Partitioner`
    /// trait) a reasonable default batch count for manual chunking.
    pub fn get_logical_divisor(&self, group_id: u32) -> u32 {
        self.get_worker_count(group_id).max(1) * WORK_SCALE
    }

    /// Start the scheduler: spawns `worker_count - 1` OS threads (the
    /// calling thread becomes worker 0), invokes `entry_fn(worker_id)`
    /// exactly once on every worker, and blocks the caller until every
    /// worker has executed the entry callback.
    ///
    /// `user_context` is an opaque pointer handed to every
    /// [`TaskContext`]; the scheduler never dereferences it. Pass
    /// `std::ptr::null()` if unused.
    pub fn begin_execution<F>(&self, entry_fn: F, user_context: *const ()) -> Result<()>
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.stopping.store(false, Ordering::Release);

        let this = self
            .weak_self
            .upgrade()
            .expect("scheduler's self-reference is alive for its own lifetime");
        let entry_fn = Arc::new(entry_fn);
        let entered = Arc::new(Semaphore::new(0));
        let mut threads = Vec::with_capacity(self.worker_count.saturating_sub(1) as usize);

        // A bare `*const ()` is `!Send`, which would make the spawned
        // closure below `!Send` and fail `thread::Builder::spawn`'s `F:
        // Send` bound. Wrap it in the `Send` newtype before the move and
        // unwrap it on the other side.
        let user_context = task_context::UserContextPtr::new(user_context);

        for worker_id in 1..self.worker_count {
            let scheduler = Arc::clone(&this);
            let entry_fn = Arc::clone(&entry_fn);
            let entered = Arc::clone(&entered);
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", self.thread_name_prefix, worker_id));
            if let Some(size) = self.stack_size {
                builder = builder.stack_size(size);
            }
            let handle = builder
                .spawn(move || {
                    entry_fn(worker_id);
                    entered.release();
                    scheduler.run_worker(worker_id, user_context.get());
                })
                .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }
        *self.threads.lock().unwrap() = threads;

        entry_fn(0);
        entered.release();
        for _ in 0..self.worker_count {
            entered.acquire();
        }

        // Worker 0 is the calling thread, not one of the OS threads spawned
        // above, so it needs its own resting identity published here rather
        // than at the top of `run_worker`: this is what lets the embedder
        // call `submit` via `task_context::current()` right after
        // `begin_execution` returns.
        task_context::set_current(TaskContext::new(
            this,
            0,
            self.default_group_for(0),
            0,
            user_context.get(),
        ));
        Ok(())
    }

    /// Re-publish the calling thread as worker 0 in thread-local storage.
    /// Needed when multiple [`Scheduler`] instances coexist and the main
    /// thread alternates between owning one and then another: after calling
    /// this, [`task_context::current`] (re-exported as
    /// [`crate::current`]) returns a context for worker 0 of `self`.
    pub fn take_ownership(&self) {
        let this = self
            .weak_self
            .upgrade()
            .expect("scheduler's self-reference is alive for its own lifetime");
        let ctx = TaskContext::new(this, 0, self.default_group_for(0), 0, std::ptr::null());
        task_context::set_current(ctx);
    }

    fn default_group_for(&self, worker_id: u32) -> u32 {
        self.priority_lists
            .get(worker_id as usize)
            .and_then(|l| l.first())
            .map(|e| self.groups[e.group_index].id())
            .unwrap_or(0)
    }

    /// Submit `work` into `group`: prefers a worker believed to be parked,
    /// falling back to round-robin placement if none looks idle. Empty
    /// groups (zero workers) fall back to the group's overflow mailbox,
    /// drained opportunistically by any worker that traverses the group.
    pub fn submit(&self, ctx: &TaskContext, group: u32, work: WorkItem) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(SchedulerError::SubmitAfterShutdown);
        }
        let wg = self
            .group_by_id(group)
            .ok_or(SchedulerError::UnknownGroup { group })?;

        let n = wg.worker_count();
        if n == 0 {
            wg.submit_to_mailbox(work);
            return Ok(());
        }

        let start = next_rand(ctx.worker_id()) % n;
        let base = wg.start_worker();

        // Pass 1: prefer a worker we believe is currently parked.
        for probe in 0..n {
            let offset = (start + probe) % n;
            let global_id = base + offset;
            if self.worker_states[global_id as usize]
                .sleeping
                .load(Ordering::Acquire)
            {
                wg.push_to_worker(offset, work);
                self.wake_worker(global_id);
                return Ok(());
            }
        }

        // Pass 2: plain round-robin — nobody looked obviously idle, so just
        // place it and wake the worker whose queue received it.
        let offset = start;
        let global_id = base + offset;
        wg.push_to_worker(offset, work);
        self.wake_worker(global_id);
        Ok(())
    }

    /// Shorthand for `submit(ctx, ctx.workgroup_id(), work)`.
    pub fn submit_default(&self, ctx: &TaskContext, work: WorkItem) -> Result<()> {
        self.submit(ctx, ctx.workgroup_id(), work)
    }

    /// Release a wake token for a specific worker, keyed by its dense
    /// global id (`group.start_worker + offset`). Always released
    /// unconditionally — the per-worker [`Semaphore`] is counting, so a
    /// release that arrives just before the worker parks is not lost; it is
    /// simply consumed the instant the worker calls `park.acquire()` instead
    /// of blocking. Gating this on the `sleeping` flag would risk skipping
    /// the release in the narrow window between a worker finding no work and
    /// actually marking itself parked, which can strand a task in that
    /// worker's own queue indefinitely.
    fn wake_worker(&self, worker_id: u32) {
        self.worker_states[worker_id as usize].park.release();
    }

    /// Block the calling thread until every workgroup's strong has-work
    /// predicate is false. Used by embedders to know all submitted work
    /// has completed.
    ///
    /// Drives its own find-and-execute loop via `busy_work` rather than
    /// purely polling: worker 0 is the calling thread of `begin_execution`
    /// and never gets a spawned OS thread of its own (see `run_worker`'s
    /// doc comment), so for a single-worker scheduler nothing would ever
    /// execute a submitted task unless the caller's own thread cooperates.
    pub fn wait_for_tasks(&self) {
        let ctx = task_context::current();
        loop {
            if self.groups.iter().all(|g| !g.has_work_strong()) {
                return;
            }
            let ran = ctx.as_ref().is_some_and(|c| self.busy_work(c));
            if !ran {
                thread::yield_now();
            }
        }
    }

    /// Steal and execute at most one task cooperatively; returns `true` if
    /// a task ran. Never blocks.
    pub fn busy_work(&self, ctx: &TaskContext) -> bool {
        const ATTEMPTS: u32 = 3;
        for _ in 0..ATTEMPTS {
            if let Some((mut item, group_id, offset)) = self.find_one_task(ctx.worker_id()) {
                let task_ctx = TaskContext::new(
                    // A TaskContext reaching busy_work always carries a
                    // live scheduler handle outside of the `for_test`
                    // construction path.
                    ctx.scheduler()
                        .cloned()
                        .expect("busy_work requires a live scheduler"),
                    ctx.worker_id(),
                    group_id,
                    offset,
                    ctx.user_context_ptr(),
                );
                self.run_item(&mut item, &task_ctx, group_id);
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Request shutdown: wait for all pending work, stop new submissions,
    /// wake every worker, and join all OS threads.
    pub fn end_execution(&self) {
        self.wait_for_tasks();
        self.stopping.store(true, Ordering::Release);

        for state in &self.worker_states {
            state.park.release();
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::Release);
    }

    fn find_one_task(&self, worker_id: u32) -> Option<(WorkItem, u32, u32)> {
        let priority_list = self.priority_lists.get(worker_id as usize)?;
        for entry in priority_list {
            let wg = &self.groups[entry.group_index];

            if let Some(item) = wg.pop_from_worker(entry.offset) {
                return Some((item, wg.id(), entry.offset));
            }
            let hint = next_rand(worker_id);
            if let Some(item) = wg.steal(entry.offset, hint) {
                return Some((item, wg.id(), entry.offset));
            }
            if let Some(item) = wg.receive_from_mailbox() {
                return Some((item, wg.id(), entry.offset));
            }
        }
        None
    }

    fn run_item(&self, item: &mut WorkItem, ctx: &TaskContext, group_id: u32) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            task_context::with_current(ctx, || item.run(ctx));
        }));
        if let Err(payload) = result {
            error!(group = group_id, "task panicked: {}", panic_message(&payload));
        }
        if let Some(wg) = self.group_by_id(group_id) {
            wg.sink_one_work();
        }
    }

    fn run_worker(self: Arc<Self>, worker_id: u32, user_context: *const ()) {
        let group_id = self.default_group_for(worker_id);
        debug!(worker_id, group_id, "worker loop starting");
        let state = &self.worker_states[worker_id as usize];

        // Publish this worker's resting identity before entering the loop,
        // so `task_context::current()` resolves even between tasks (e.g. if
        // embedder code running on a worker thread, outside of any task,
        // ever queries it). `run_item` scopes a task's own context around
        // each invocation and restores this resting one afterward.
        task_context::set_current(TaskContext::new(
            Arc::clone(&self),
            worker_id,
            group_id,
            0,
            user_context,
        ));

        loop {
            let mut ran_any = false;
            while let Some((mut item, group_id, offset)) = self.find_one_task(worker_id) {
                let ctx =
                    TaskContext::new(Arc::clone(&self), worker_id, group_id, offset, user_context);
                self.run_item(&mut item, &ctx, group_id);
                state.failure_streak.store(0, Ordering::Relaxed);
                ran_any = true;
            }

            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            if ran_any {
                continue;
            }

            let streak = state.failure_streak.fetch_add(1, Ordering::Relaxed);
            if streak < SPIN_THRESHOLD {
                std::hint::spin_loop();
                continue;
            } else if streak < YIELD_THRESHOLD {
                thread::yield_now();
                continue;
            }

            state.sleeping.store(true, Ordering::Release);
            state.park.acquire();
            state.sleeping.store(false, Ordering::Release);
            state.failure_streak.store(0, Ordering::Relaxed);

            if self.stopping.load(Ordering::Acquire) {
                break;
            }
        }
        debug!(worker_id, "worker loop stopped");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            warn!("scheduler dropped while still running; forcing shutdown");
            self.stopping.store(true, Ordering::Release);
            for state in &self.worker_states {
                state.park.release();
            }
            let threads = std::mem::take(&mut *self.threads.lock().unwrap());
            for handle in threads {
                let _ = handle.join();
            }
        }
    }
}
