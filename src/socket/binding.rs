//! The single-reader/single-writer invariant.
//!
//! A connection has one read-side slot and one write-side slot. A task
//! must hold the slot for a direction before suspending on it; a second
//! task finding the slot occupied is a programming error in the calling
//! code, surfaced as a typed [`SockError::AlreadyBound`] plus an
//! error-level log. The violating operation fails; the process keeps
//! running and the embedder decides how to react.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::base::error::SockError;

/// An I/O direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

impl Direction {
    pub(crate) fn slot(self) -> crate::socket::timeout::Slot {
        match self {
            Direction::Read => crate::socket::timeout::Slot::Read,
            Direction::Write => crate::socket::timeout::Slot::Write,
        }
    }
}

/// Occupancy marker. The task id is kept for diagnostics when available
/// (`tokio::task::try_id` returns `None` outside a task context).
#[derive(Debug, Clone, Copy)]
struct BoundTask {
    id: Option<tokio::task::Id>,
}

impl fmt::Display for BoundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "task#{id}"),
            None => f.write_str("<non-task context>"),
        }
    }
}

/// The two binding slots of one connection.
#[derive(Debug, Default)]
pub(crate) struct BindingSlots {
    read: Mutex<Option<BoundTask>>,
    write: Mutex<Option<BoundTask>>,
}

impl BindingSlots {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slot(&self, dir: Direction) -> &Mutex<Option<BoundTask>> {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Claim a direction for the current task. Fails when the slot is
    /// already occupied; the check happens before any syscall for that
    /// direction is attempted.
    pub(crate) fn bind(self: &Arc<Self>, dir: Direction, fd: RawFd) -> Result<BindGuard, SockError> {
        let mut slot = self.slot(dir).lock().unwrap();
        if let Some(owner) = *slot {
            tracing::error!(
                fd,
                direction = %dir,
                owner = %owner,
                "socket direction already bound; concurrent use of the same \
                 direction from multiple tasks is not allowed"
            );
            return Err(SockError::AlreadyBound { direction: dir, fd });
        }
        *slot = Some(BoundTask {
            id: tokio::task::try_id(),
        });
        drop(slot);
        Ok(BindGuard {
            slots: self.clone(),
            dir,
        })
    }

    pub(crate) fn is_bound(&self, dir: Direction) -> bool {
        self.slot(dir).lock().unwrap().is_some()
    }
}

/// Releases the claimed slot on drop, including when the waiting future
/// is cancelled.
#[derive(Debug)]
pub(crate) struct BindGuard {
    slots: Arc<BindingSlots>,
    dir: Direction,
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        *self.slots.slot(self.dir).lock().unwrap() = None;
    }
}
