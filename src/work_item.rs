//! Type-erased, move-only callable scheduled for execution exactly once.
//!
//! The distilled design calls for inline storage up to 64 bytes with a
//! compile-time rejection of larger captures. Rust has no portable,
//! safe-without-macros equivalent of the source language's template trick
//! for that (see `DESIGN.md`), so this crate follows the teacher's own
//! type-erasure idiom instead: a single heap allocation per task. The
//! "invoked exactly once, non-copyable, non-throwing" contract is
//! preserved exactly.

use crate::task_context::TaskContext;

type BoxedWork = Box<dyn FnOnce(&TaskContext) + Send + 'static>;

/// A single schedulable unit of work.
///
/// Holds an `Option` so the callable can be `.take()`n and invoked exactly
/// once; a second call to [`WorkItem::run`] is a no-op and returns `false`.
pub struct WorkItem {
    work: Option<BoxedWork>,
}

impl WorkItem {
    /// Wrap a closure as a work item.
    ///
    /// The closure must not panic; a task body that panics is a programmer
    /// error (see `error::SchedulerError` doc comment and §7 of
    /// `SPEC_FULL.md`) and is caught at the call site with
    /// `catch_unwind` rather than being allowed to unwind across the
    /// worker loop.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        Self {
            work: Some(Box::new(f)),
        }
    }

    /// Invoke the stored callable, consuming it.
    ///
    /// Returns `true` if work was present and ran, `false` if this item had
    /// already been consumed by a previous call.
    pub fn run(&mut self, ctx: &TaskContext) -> bool {
        if let Some(f) = self.work.take() {
            f(ctx);
            true
        } else {
            false
        }
    }

    /// `true` if this item has not yet been run.
    pub fn is_pending(&self) -> bool {
        self.work.is_some()
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("pending", &self.work.is_some())
            .finish()
    }
}
