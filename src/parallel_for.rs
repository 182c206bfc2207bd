//! Adaptive data-parallel range splitting built on `submit` + cooperative
//! busy-waiting.
//!
//! Two entry points stand in for the call-signature dispatch of a
//! template-based `auto_parallel_for`: [`auto_parallel_for_range`] for a
//! per-subrange lambda `Fn(usize, usize, &TaskContext)`, and
//! [`auto_parallel_for_each`] for a per-element lambda
//! `Fn(&mut T, &TaskContext)` over a mutable slice. Both dispatch through
//! the same [`AutoPartitioner`] splitting policy. [`default_parallel_for_range`]
//! offers a non-adaptive alternative that just slices the range into a
//! fixed batch count and never reacts to stealing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::task_context::TaskContext;
use crate::work_item::WorkItem;

/// Policy knobs for the adaptive partitioner.
#[derive(Clone, Copy, Debug)]
pub struct AutoPartitioner {
    /// Minimum chunk size worth considering for further splitting.
    pub grain_size: usize,
    /// Recursion budget; a chunk stops splitting once its depth reaches this.
    pub max_depth: u32,
    /// Added to a chunk's depth budget the first time it runs on a worker
    /// other than its spawner.
    pub depth_increment: u32,
    /// Capacity of the bounded `range_pool` deque used while splitting a
    /// single chunk further.
    pub range_pool_capacity: usize,
    /// Ranges at or below this length are executed entirely sequentially,
    /// with no submissions at all.
    pub sequential_threshold: usize,
}

impl Default for AutoPartitioner {
    fn default() -> Self {
        Self {
            grain_size: 1,
            max_depth: 8,
            depth_increment: 2,
            range_pool_capacity: 16,
            sequential_threshold: 1,
        }
    }
}

/// A non-adaptive partitioner: splits eagerly into `batches_per_worker`
/// chunks per worker and never reacts to stealing.
#[derive(Clone, Copy, Debug)]
pub struct DefaultPartitioner {
    pub batches_per_worker: usize,
}

impl Default for DefaultPartitioner {
    fn default() -> Self {
        Self {
            batches_per_worker: 1,
        }
    }
}

/// Computes how many pieces a range should be split into up front. Both
/// partitioners implement this so callers can pick either one at the call
/// site.
pub trait Partitioner {
    fn initial_divisor(&self, worker_count: u32, len: usize) -> usize;
    fn sequential_threshold(&self) -> usize;
}

impl Partitioner for AutoPartitioner {
    fn initial_divisor(&self, worker_count: u32, len: usize) -> usize {
        if self.grain_size == 0 {
            return 1;
        }
        let by_workers = worker_count as usize * self.grain_size;
        let by_size = len / self.grain_size;
        by_workers.min(by_size)
    }

    fn sequential_threshold(&self) -> usize {
        self.sequential_threshold
    }
}

impl Partitioner for DefaultPartitioner {
    fn initial_divisor(&self, worker_count: u32, _len: usize) -> usize {
        (worker_count as usize * self.batches_per_worker).max(1)
    }

    fn sequential_threshold(&self) -> usize {
        1
    }
}

struct ForState<F> {
    func: F,
    outstanding: AtomicI64,
    spawner: u32,
    policy: AutoPartitioner,
}

/// Split `[start, end)` into `divisor` pieces of near-equal size.
fn split_into_chunks(start: usize, end: usize, divisor: usize) -> Vec<(usize, usize)> {
    let len = end - start;
    let base = len / divisor;
    let rem = len % divisor;
    let mut chunks = Vec::with_capacity(divisor);
    let mut cur = start;
    for i in 0..divisor {
        let size = base + usize::from(i < rem);
        chunks.push((cur, cur + size));
        cur += size;
    }
    chunks
}

/// Repeatedly split the current range, alternating back-splits and
/// front-splits so the cache-warm half stays on the side about to be
/// executed in place, until the pool is full or nothing further splits.
fn split_to_fill(start: usize, end: usize, grain: usize, capacity: usize) -> Vec<(usize, usize)> {
    let mut pool = vec![(start, end)];
    let mut back_split = true;
    while pool.len() < capacity {
        let idx = if back_split { pool.len() - 1 } else { 0 };
        let (s, e) = pool[idx];
        if e - s <= grain {
            break;
        }
        let mid = s + (e - s) / 2;
        if back_split {
            pool[idx] = (s, mid);
            pool.insert(idx + 1, (mid, e));
        } else {
            pool[idx] = (mid, e);
            pool.insert(idx, (s, mid));
        }
        back_split = !back_split;
    }
    pool
}

fn submit_chunk<F>(
    state: &Arc<ForState<F>>,
    ctx: &TaskContext,
    group: u32,
    start: usize,
    end: usize,
    depth: u32,
    divisor: usize,
    max_depth: u32,
) where
    F: Fn(usize, usize, &TaskContext) + Send + Sync + 'static,
{
    state.outstanding.fetch_add(1, Ordering::Release);
    let state = Arc::clone(state);
    let work = WorkItem::new(move |inner_ctx| {
        execute_chunk(&state, inner_ctx, group, start, end, depth, divisor, max_depth);
        state.outstanding.fetch_sub(1, Ordering::Release);
    });
    // A submission failure here is unreachable with the current unbounded
    // queues, but if it ever occurred the chunk would simply never run;
    // there is no synchronous fallback since we are already inside a task.
    let _ = ctx.submit(group, work);
}

fn execute_chunk<F>(
    state: &Arc<ForState<F>>,
    ctx: &TaskContext,
    group: u32,
    start: usize,
    end: usize,
    depth: u32,
    mut divisor: usize,
    mut max_depth: u32,
) where
    F: Fn(usize, usize, &TaskContext) + Send + Sync + 'static,
{
    let stolen = ctx.worker_id() != state.spawner;
    if stolen {
        // A chunk picked up by a worker other than its spawner raises its
        // own depth *budget* rather than pushing the current depth toward
        // the ceiling, so a stolen chunk (and everything it goes on to
        // submit) gets more room to keep splitting across idle workers
        // instead of being cut off sooner.
        max_depth += state.policy.depth_increment;
        divisor = divisor.saturating_mul(4);
    }

    let grain = state.policy.grain_size.max(1);
    let len = end - start;
    if len <= grain.saturating_mul(divisor) || depth >= max_depth {
        (state.func)(start, end, ctx);
        return;
    }

    let pool = split_to_fill(start, end, grain, state.policy.range_pool_capacity);
    let stealing_signal = stolen || grain > 1;

    let mut remaining = pool;
    if stealing_signal {
        while remaining.len() > 1 {
            let (s, e) = remaining.remove(0);
            submit_chunk(state, ctx, group, s, e, depth + 1, divisor, max_depth);
        }
    }
    for (s, e) in remaining {
        (state.func)(s, e, ctx);
    }
}

/// Adaptively split `range` across `group`'s workers, calling `f(start,
/// end, ctx)` once per final chunk. Blocks the calling worker
/// (cooperatively, via [`TaskContext::busy_work`]) until every dispatched
/// chunk has completed.
pub fn auto_parallel_for_range<F>(
    ctx: &TaskContext,
    group: u32,
    range: std::ops::Range<usize>,
    policy: AutoPartitioner,
    f: F,
) where
    F: Fn(usize, usize, &TaskContext) + Send + Sync + 'static,
{
    let len = range.len();
    if len == 0 {
        return;
    }
    if len <= policy.sequential_threshold() {
        f(range.start, range.end, ctx);
        return;
    }

    let worker_count = ctx.scheduler().map_or(1, |s| s.get_worker_count(group));
    let initial_divisor = policy.initial_divisor(worker_count, len);
    if initial_divisor <= 1 {
        f(range.start, range.end, ctx);
        return;
    }

    let state = Arc::new(ForState {
        func: f,
        outstanding: AtomicI64::new(0),
        spawner: ctx.worker_id(),
        policy,
    });

    let chunks = split_into_chunks(range.start, range.end, initial_divisor);
    for &(s, e) in &chunks[..chunks.len() - 1] {
        submit_chunk(&state, ctx, group, s, e, 0, initial_divisor, policy.max_depth);
    }
    let (last_start, last_end) = chunks[chunks.len() - 1];
    execute_chunk(
        &state,
        ctx,
        group,
        last_start,
        last_end,
        0,
        initial_divisor,
        policy.max_depth,
    );

    while state.outstanding.load(Ordering::Acquire) > 0 {
        if !ctx.busy_work() {
            std::hint::spin_loop();
        }
    }
}

/// Non-adaptive counterpart of [`auto_parallel_for_range`]: slices `range`
/// into `policy.batches_per_worker * worker_count` pieces up front and
/// never reacts to stealing.
pub fn default_parallel_for_range<F>(
    ctx: &TaskContext,
    group: u32,
    range: std::ops::Range<usize>,
    policy: DefaultPartitioner,
    f: F,
) where
    F: Fn(usize, usize, &TaskContext) + Send + Sync + 'static,
{
    let len = range.len();
    if len == 0 {
        return;
    }
    let worker_count = ctx.scheduler().map_or(1, |s| s.get_worker_count(group));
    let divisor = policy.initial_divisor(worker_count, len).max(1);
    if divisor <= 1 {
        f(range.start, range.end, ctx);
        return;
    }

    let outstanding = Arc::new(AtomicI64::new(0));
    let f = Arc::new(f);
    let chunks = split_into_chunks(range.start, range.end, divisor);
    for &(s, e) in &chunks[..chunks.len() - 1] {
        outstanding.fetch_add(1, Ordering::Release);
        let f = Arc::clone(&f);
        let outstanding2 = Arc::clone(&outstanding);
        let work = WorkItem::new(move |inner_ctx| {
            f.as_ref()(s, e, inner_ctx);
            outstanding2.fetch_sub(1, Ordering::Release);
        });
        let _ = ctx.submit(group, work);
    }
    let (last_start, last_end) = chunks[chunks.len() - 1];
    f.as_ref()(last_start, last_end, ctx);

    while outstanding.load(Ordering::Acquire) > 0 {
        if !ctx.busy_work() {
            std::hint::spin_loop();
        }
    }
}

/// A raw pointer wrapper asserting that disjoint index ranges carved out of
/// the same slice may be written from different threads concurrently. Only
/// constructed and consumed within this module, which guarantees the
/// ranges handed to each chunk never overlap.
struct DisjointSlicePtr<T>(*mut T);

unsafe impl<T> Send for DisjointSlicePtr<T> {}
unsafe impl<T> Sync for DisjointSlicePtr<T> {}

/// Adaptively split `items` across `group`'s workers, calling `f(element,
/// ctx)` exactly once per element. Blocks the calling worker until every
/// dispatched chunk has completed.
pub fn auto_parallel_for_each<T, F>(
    ctx: &TaskContext,
    group: u32,
    items: &mut [T],
    policy: AutoPartitioner,
    f: F,
) where
    T: Send,
    F: Fn(&mut T, &TaskContext) + Send + Sync + 'static,
{
    let len = items.len();
    let ptr = DisjointSlicePtr(items.as_mut_ptr());
    let f = Arc::new(f);
    auto_parallel_for_range(ctx, group, 0..len, policy, move |start, end, ctx| {
        let base = ptr.0;
        for i in start..end {
            // SAFETY: auto_parallel_for_range guarantees every dispatched
            // [start, end) sub-range is disjoint and visited exactly once,
            // so no two chunks ever alias the same index.
            let element = unsafe { &mut *base.add(i) };
            f.as_ref()(element, ctx);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering as O};

    #[test]
    fn doubles_every_element_exactly_once() {
        let scheduler = Scheduler::builder().create_group(0, 0, 4, 0).unwrap().build().unwrap();
        scheduler.clone().begin_execution(|_| {}, std::ptr::null()).unwrap();
        let ctx = TaskContext::new(Arc::clone(&scheduler), 0, 0, 0, std::ptr::null());

        let mut data: Vec<i64> = (0..10_000).collect();
        auto_parallel_for_each(&ctx, 0, &mut data, AutoPartitioner::default(), |x, _ctx| {
            *x *= 2;
        });

        for (i, value) in data.iter().enumerate() {
            assert_eq!(*value, i as i64 * 2);
        }
        scheduler.end_execution();
    }

    #[test]
    fn sums_range_to_expected_total() {
        let scheduler = Scheduler::builder().create_group(0, 0, 4, 0).unwrap().build().unwrap();
        scheduler.clone().begin_execution(|_| {}, std::ptr::null()).unwrap();
        let ctx = TaskContext::new(Arc::clone(&scheduler), 0, 0, 0, std::ptr::null());

        let sum = Arc::new(AtomicUsize::new(0));
        let sum2 = Arc::clone(&sum);
        auto_parallel_for_range(&ctx, 0, 0..100, AutoPartitioner::default(), move |start, end, _ctx| {
            let partial: usize = (start..end).sum();
            sum2.fetch_add(partial, O::Relaxed);
        });

        assert_eq!(sum.load(O::Relaxed), 4950);
        scheduler.end_execution();
    }

    #[test]
    fn empty_range_invokes_nothing() {
        let scheduler = Scheduler::builder().create_group(0, 0, 2, 0).unwrap().build().unwrap();
        scheduler.clone().begin_execution(|_| {}, std::ptr::null()).unwrap();
        let ctx = TaskContext::new(Arc::clone(&scheduler), 0, 0, 0, std::ptr::null());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        auto_parallel_for_range(&ctx, 0, 0..0, AutoPartitioner::default(), move |_, _, _| {
            calls2.fetch_add(1, O::Relaxed);
        });
        assert_eq!(calls.load(O::Relaxed), 0);
        scheduler.end_execution();
    }

    #[test]
    fn single_element_range_runs_once_on_calling_worker() {
        let scheduler = Scheduler::builder().create_group(0, 0, 4, 0).unwrap().build().unwrap();
        scheduler.clone().begin_execution(|_| {}, std::ptr::null()).unwrap();
        let ctx = TaskContext::new(Arc::clone(&scheduler), 0, 0, 0, std::ptr::null());

        let seen_worker = Arc::new(AtomicUsize::new(usize::MAX));
        let seen_worker2 = Arc::clone(&seen_worker);
        auto_parallel_for_range(&ctx, 0, 0..1, AutoPartitioner::default(), move |_, _, ctx| {
            seen_worker2.store(ctx.worker_id() as usize, O::Relaxed);
        });
        assert_eq!(seen_worker.load(O::Relaxed), 0);
        scheduler.end_execution();
    }

    #[test]
    fn range_at_or_below_sequential_threshold_runs_synchronously() {
        let scheduler = Scheduler::builder().create_group(0, 0, 4, 0).unwrap().build().unwrap();
        scheduler.clone().begin_execution(|_| {}, std::ptr::null()).unwrap();
        let ctx = TaskContext::new(Arc::clone(&scheduler), 0, 0, 0, std::ptr::null());

        let mut policy = AutoPartitioner::default();
        policy.sequential_threshold = 8;
        let seen_worker = Arc::new(AtomicUsize::new(usize::MAX));
        let seen_worker2 = Arc::clone(&seen_worker);
        auto_parallel_for_range(&ctx, 0, 0..8, policy, move |_, _, ctx| {
            seen_worker2.store(ctx.worker_id() as usize, O::Relaxed);
        });
        assert_eq!(seen_worker.load(O::Relaxed), 0);
        scheduler.end_execution();
    }

    #[test]
    fn nested_parallel_for_visits_every_combination_once() {
        let scheduler = Scheduler::builder().create_group(0, 0, 4, 0).unwrap().build().unwrap();
        scheduler.clone().begin_execution(|_| {}, std::ptr::null()).unwrap();
        let ctx = TaskContext::new(Arc::clone(&scheduler), 0, 0, 0, std::ptr::null());

        let visits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let visits = Arc::clone(&visits);
            ctx.submit(0, WorkItem::new(move |inner_ctx| {
                let visits = Arc::clone(&visits);
                auto_parallel_for_range(inner_ctx, 0, 0..1000, AutoPartitioner::default(), move |s, e, _ctx| {
                    visits.fetch_add(e - s, O::Relaxed);
                });
            }))
            .unwrap();
        }
        scheduler.wait_for_tasks();
        assert_eq!(visits.load(O::Relaxed), 10_000);
        scheduler.end_execution();
    }

    #[test]
    fn default_partitioner_splits_into_fixed_batch_count() {
        let scheduler = Scheduler::builder().create_group(0, 0, 4, 0).unwrap().build().unwrap();
        scheduler.clone().begin_execution(|_| {}, std::ptr::null()).unwrap();
        let ctx = TaskContext::new(Arc::clone(&scheduler), 0, 0, 0, std::ptr::null());

        let visited = Arc::new(AtomicUsize::new(0));
        let visited2 = Arc::clone(&visited);
        default_parallel_for_range(
            &ctx,
            0,
            0..4000,
            DefaultPartitioner {
                batches_per_worker: 2,
            },
            move |s, e, _ctx| {
                visited2.fetch_add(e - s, O::Relaxed);
            },
        );
        assert_eq!(visited.load(O::Relaxed), 4000);
        scheduler.end_execution();
    }
}
