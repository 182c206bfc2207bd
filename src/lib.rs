//! scheduler-core
//!
//! An embeddable, fixed-pool work-stealing task scheduler: priority-ordered
//! workgroups of OS worker threads, each with a Chase-Lev work-stealing
//! deque and an overflow mailbox, plus an adaptive `parallel_for` built on
//! top of `submit`/`busy_wait`, and a small reusable DAG façade for chaining
//! dependent work.
//!
//! See [`Scheduler`] for the runtime entry point and [`TaskContext`] for
//! what a running task can do.

pub mod error;
pub mod flow_graph;
pub mod mailbox;
pub mod parallel_for;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task_context;
pub mod work_item;
pub mod workgroup;

pub use error::{Result, SchedulerError};
pub use flow_graph::{FlowGraph, NodeId};
pub use parallel_for::{auto_parallel_for_each, auto_parallel_for_range, Partitioner};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use sync::Semaphore;
pub use task_context::{current, TaskContext};
pub use work_item::WorkItem;
