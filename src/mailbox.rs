//! Generic MPSC mailbox wrapping `crossbeam_channel`, used by
//! [`crate::workgroup::Workgroup`] as the per-group overflow mailbox: the
//! secondary queue a submission falls back to once every per-worker queue
//! in the group has refused it for a bounded number of retries (§4.5 of
//! `SPEC_FULL.md`). Kept generic over `T` so it can hold
//! [`crate::work_item::WorkItem`] without this module depending on it.
//!
//! # Example
//!
//! ```rust
//! use scheduler_core::mailbox::Mailbox;
//!
//! let (sender, mailbox) = Mailbox::<String>::unbounded();
//! sender.send("hello".to_string()).unwrap();
//! assert_eq!(mailbox.recv(), Some("hello".to_string()));
//! assert!(mailbox.is_empty());
//! ```

use crossbeam_channel::{self as cb};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned when sending into a closed mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxSendError<T>(pub T);

impl<T> fmt::Display for MailboxSendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mailbox send failed: receiver has been dropped")
    }
}

impl<T: fmt::Debug> std::error::Error for MailboxSendError<T> {}

/// Error returned by blocking receive when the mailbox is closed and empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxRecvError;

impl fmt::Display for MailboxRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mailbox recv failed: all senders dropped and queue empty"
        )
    }
}

impl std::error::Error for MailboxRecvError {}

// ---------------------------------------------------------------------------
// MailboxSender
// ---------------------------------------------------------------------------

/// The sending half of a mailbox.
///
/// Cheaply cloneable — multiple producers can hold a `MailboxSender` and
/// send messages concurrently. The mailbox is only closed when *all* senders
/// are dropped.
pub struct MailboxSender<T> {
    inner: cb::Sender<T>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for MailboxSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSender")
            .field("pending", &self.inner.len())
            .finish()
    }
}

impl<T> MailboxSender<T> {
    /// Non-blocking send. Returns `Err` if the mailbox receiver has been dropped.
    pub fn send(&self, msg: T) -> Result<(), MailboxSendError<T>> {
        self.inner.send(msg).map_err(|e| MailboxSendError(e.0))
    }

    /// Number of messages currently buffered in the mailbox.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the mailbox buffer is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// A receive-side mailbox wrapping an MPSC channel.
///
/// Provides non-blocking (`recv`), blocking (`recv_blocking`), and
/// timeout-based (`recv_timeout`) receive operations.
pub struct Mailbox<T> {
    inner: cb::Receiver<T>,
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.inner.len())
            .finish()
    }
}

impl<T> Mailbox<T> {
    /// Create an unbounded mailbox, returning `(sender, mailbox)`.
    ///
    /// The sender never blocks; memory is the only limit on buffering.
    pub fn unbounded() -> (MailboxSender<T>, Self) {
        let (tx, rx) = cb::unbounded();
        (MailboxSender { inner: tx }, Self { inner: rx })
    }

    /// Create a bounded mailbox with the given capacity.
    ///
    /// Senders block when the buffer is full (back-pressure).
    pub fn bounded(capacity: usize) -> (MailboxSender<T>, Self) {
        let (tx, rx) = cb::bounded(capacity);
        (MailboxSender { inner: tx }, Self { inner: rx })
    }

    /// Non-blocking receive. Returns `None` if no message is available.
    ///
    /// This returns `None` both when the channel is empty-but-open and when
    /// it is closed-and-drained. Use `is_disconnected` to distinguish.
    pub fn recv(&self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    /// Blocking receive. Waits until a message arrives.
    ///
    /// Returns `Err(MailboxRecvError)` only when all senders have been dropped
    /// and the queue is empty.
    pub fn recv_blocking(&self) -> Result<T, MailboxRecvError> {
        self.inner.recv().map_err(|_| MailboxRecvError)
    }

    /// Receive with a timeout. Returns `None` if no message arrives within
    /// `duration`, or if all senders have been dropped.
    pub fn recv_timeout(&self, duration: Duration) -> Option<T> {
        self.inner.recv_timeout(duration).ok()
    }

    /// Number of messages currently buffered.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the mailbox is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns `true` if all senders have been dropped.
    ///
    /// Note: even if disconnected, there may still be buffered messages
    /// retrievable via `recv` / `recv_blocking`.
    pub fn is_disconnected(&self) -> bool {
        // crossbeam's Receiver has no direct disconnected query; a
        // zero-duration recv distinguishes "disconnected" from "empty but
        // open" without consuming a real message.
        match self.inner.recv_timeout(Duration::ZERO) {
            Err(cb::RecvTimeoutError::Disconnected) => self.inner.is_empty(),
            _ => false,
        }
    }

    /// Drain all currently-buffered messages into a `Vec`.
    pub fn drain(&self) -> Vec<T> {
        let mut msgs = Vec::new();
        while let Ok(msg) = self.inner.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Provide access to the underlying crossbeam `Receiver` for use in
    /// `crossbeam_channel::select!`.
    pub fn as_receiver(&self) -> &cb::Receiver<T> {
        &self.inner
    }
}

// ---------------------------------------------------------------------------
// Convenience constructor
// ---------------------------------------------------------------------------

/// Create a mailbox pair, bounded if `capacity` is given, unbounded
/// otherwise.
pub fn mailbox_pair<T>(capacity: Option<usize>) -> (MailboxSender<T>, Mailbox<T>) {
    match capacity {
        Some(cap) => Mailbox::bounded(cap),
        None => Mailbox::unbounded(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
