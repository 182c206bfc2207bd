//! The immutable record passed to every task body, and the thread-local
//! "current context" slot each worker publishes before invoking a task.

use std::cell::RefCell;
use std::sync::Arc;

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::sync::Semaphore;
use crate::work_item::WorkItem;

/// An opaque, scheduler-owned-but-not-dereferenced pointer to embedder
/// state, handed through to every task.
///
/// The scheduler never reads through this pointer; it only stores and
/// copies it. Safety of [`TaskContext::get_user_context`] is entirely the
/// embedder's responsibility: the pointer must outlive the
/// `begin_execution`/`end_execution` bracket and must actually point to a
/// `T`.
///
/// `pub(crate)` (rather than private) so `scheduler.rs` can carry a raw
/// `*const ()` across the `thread::Builder::spawn` boundary: a bare raw
/// pointer is `!Send`, which would make the spawned worker closure `!Send`
/// and fail to compile against `spawn`'s `F: Send` bound.
#[derive(Clone, Copy)]
pub(crate) struct UserContextPtr(*const ());

// The pointer is only ever read back as `&T` by embedder code that knows
// the true type; the scheduler treats it as inert bytes and never
// dereferences it itself, so it is safe to hand across worker threads.
unsafe impl Send for UserContextPtr {}
unsafe impl Sync for UserContextPtr {}

impl UserContextPtr {
    /// Wrap a raw user-context pointer for a `Send` hand-off across a
    /// spawned thread boundary. `ptr` may be null.
    pub(crate) fn new(ptr: *const ()) -> Self {
        Self(ptr)
    }

    /// Recover the raw pointer on the far side of the hand-off.
    pub(crate) fn get(self) -> *const () {
        self.0
    }
}

/// The immutable (worker, workgroup) pairing active for the duration of one
/// task invocation.
///
/// Constructed fresh by the scheduler before each task runs; never mutated
/// or shared between threads (cheap to clone, cheap to recreate).
#[derive(Clone)]
pub struct TaskContext {
    scheduler: Option<Arc<Scheduler>>,
    worker_id: u32,
    workgroup_id: u32,
    group_offset: u32,
    user_context: Option<UserContextPtr>,
}

impl TaskContext {
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        worker_id: u32,
        workgroup_id: u32,
        group_offset: u32,
        user_context: *const (),
    ) -> Self {
        Self {
            scheduler: Some(scheduler),
            worker_id,
            workgroup_id,
            group_offset,
            user_context: if user_context.is_null() {
                None
            } else {
                Some(UserContextPtr(user_context))
            },
        }
    }

    /// Build a standalone context for unit tests that exercise a single
    /// module (e.g. [`WorkItem`](crate::work_item::WorkItem)) without
    /// spinning up a full [`Scheduler`]. `submit`/`busy_work`/`busy_wait`
    /// return `Err`/no-ops on a context built this way.
    pub fn for_test(worker_id: u32, workgroup_id: u32, group_offset: u32) -> Self {
        Self {
            scheduler: None,
            worker_id,
            workgroup_id,
            group_offset,
            user_context: None,
        }
    }

    /// Like [`TaskContext::for_test`] but also carries a user-context
    /// pointer, for tests of [`TaskContext::get_user_context`] that don't
    /// need a running scheduler.
    pub fn for_test_with_user_context(
        worker_id: u32,
        workgroup_id: u32,
        group_offset: u32,
        user_context: *const (),
    ) -> Self {
        Self {
            scheduler: None,
            worker_id,
            workgroup_id,
            group_offset,
            user_context: if user_context.is_null() {
                None
            } else {
                Some(UserContextPtr(user_context))
            },
        }
    }

    /// The dense, unique index of the executing worker.
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// The id of the workgroup the current task was drawn from.
    pub fn workgroup_id(&self) -> u32 {
        self.workgroup_id
    }

    /// This worker's offset within its active workgroup
    /// (`worker_id - group.start`).
    pub fn group_offset(&self) -> u32 {
        self.group_offset
    }

    /// Recover the embedder's opaque user context, if one was provided at
    /// `begin_execution` and `T` matches the type the embedder stored.
    ///
    /// # Safety
    /// The caller must ensure `T` is the same type the pointer was
    /// originally created from in `begin_execution`.
    pub unsafe fn get_user_context<T>(&self) -> Option<&T> {
        self.user_context.map(|p| &*(p.0 as *const T))
    }

    /// Submit work into `group`, shorthand for
    /// `scheduler.submit(ctx, group, work)`.
    pub fn submit(&self, group: u32, work: WorkItem) -> Result<()> {
        match &self.scheduler {
            Some(s) => s.submit(self, group, work),
            None => Err(crate::error::SchedulerError::NotRunning),
        }
    }

    /// Submit work into the currently-active workgroup.
    pub fn submit_same_group(&self, work: WorkItem) -> Result<()> {
        self.submit(self.workgroup_id, work)
    }

    /// Steal and execute one task cooperatively. See
    /// [`Scheduler::busy_work`].
    pub fn busy_work(&self) -> bool {
        match &self.scheduler {
            Some(s) => s.busy_work(self),
            None => false,
        }
    }

    /// Cooperatively busy-wait until `semaphore` has been signalled,
    /// stealing and executing tasks in the meantime instead of blocking.
    pub fn busy_wait(&self, semaphore: &Semaphore) {
        while !semaphore.try_acquire() {
            if !self.busy_work() {
                std::hint::spin_loop();
            }
        }
    }

    /// Access to the owning scheduler, for callers (e.g. `parallel_for`)
    /// that need more than the shorthand methods above.
    pub(crate) fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref()
    }

    /// The raw user-context pointer this context was constructed with, for
    /// re-threading it into a fresh `TaskContext` (e.g. `Scheduler::busy_work`
    /// building the context for a cooperatively-executed task) without the
    /// caller needing to know the embedder's concrete type.
    pub(crate) fn user_context_ptr(&self) -> *const () {
        self.user_context.map_or(std::ptr::null(), |p| p.0)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("worker_id", &self.worker_id)
            .field("workgroup_id", &self.workgroup_id)
            .field("group_offset", &self.group_offset)
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

/// Publish `ctx` as the thread-local "current" context for the duration of
/// `f`, restoring whatever was previously published afterwards.
///
/// Used when executing one task so that a stolen task's context doesn't
/// leak into the resting worker identity published by [`set_current`].
pub(crate) fn with_current<R>(ctx: &TaskContext, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(ctx.clone()));
    let result = f();
    CURRENT.with(|slot| *slot.borrow_mut() = previous);
    result
}

/// Persistently publish `ctx` as this thread's current context, with no
/// corresponding restore.
///
/// Called once by `run_worker` before a worker enters its find-work loop
/// (establishing its resting "who am I" identity), and by
/// [`crate::scheduler::Scheduler::take_ownership`] when the calling thread
/// re-publishes itself as worker 0 for a scheduler it is about to drive.
pub(crate) fn set_current(ctx: TaskContext) {
    CURRENT.with(|slot| *slot.borrow_mut() = Some(ctx));
}

/// The context of the task currently executing on this thread, if any.
pub fn current() -> Option<TaskContext> {
    CURRENT.with(|slot| slot.borrow().clone())
}
