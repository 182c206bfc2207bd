//! Error taxonomy for the scheduler runtime.
//!
//! Per the three-way split in the design notes: programmer errors are
//! surfaced here as a typed [`SchedulerError`]; transient backpressure is
//! handled internally by retrying and ultimately falling through to the
//! overflow mailbox (never an error); "no work" is represented by `None`
//! returns from the queue and mailbox APIs, never an error.

use thiserror::Error;

/// Fatal, programmer-facing errors.
///
/// None of these are meant to be recovered from in the ordinary sense —
/// they indicate the embedder violated the scheduler's construction or
/// lifecycle contract — but they are returned as `Result` rather than
/// panicking so an embedder can choose how to fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// `begin_execution` was called on a scheduler that is already running.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// An operation that requires a running scheduler was attempted before
    /// `begin_execution` or after `end_execution`.
    #[error("scheduler is not running")]
    NotRunning,

    /// More than 32 workgroups were declared; group membership is tracked
    /// with a bitmask that only has 32 bits.
    #[error("too many workgroups declared: max is {max}")]
    TooManyGroups { max: u32 },

    /// A group's declared worker range does not fit within the total
    /// worker count implied by all declared groups.
    #[error(
        "group {group} range [{start}, {end}) exceeds worker count {worker_count}"
    )]
    GroupOutOfRange {
        group: u32,
        start: u32,
        end: u32,
        worker_count: u32,
    },

    /// A group id was declared twice.
    #[error("group {group} was already declared")]
    DuplicateGroup { group: u32 },

    /// `submit` was called with a group id that was never declared.
    #[error("unknown workgroup {group}")]
    UnknownGroup { group: u32 },

    /// A submission was attempted after `end_execution` had already been
    /// called (or while shutdown was in progress).
    #[error("cannot submit work: scheduler is shutting down or stopped")]
    SubmitAfterShutdown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
