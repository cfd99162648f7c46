//! # Object synchronization
//!
//! Every object can be used as a recursive mutual-exclusion lock. Two
//! families of algorithms implement that lock; which one is used is decided
//! once when the runtime is built (see [`LockingMode`](crate::options::LockingMode)):
//!
//! - [`legacy`]: stack-locking. The header is swapped for the address of the
//!   owner's [`BasicLock`], which keeps the displaced header. Contention
//!   inflates the lock into an [`ObjectMonitor`].
//! - [`lightweight`]: fast-locking. Only the lock bits of the header change
//!   and the owner remembers the object on its [`LockStack`](lock_stack::LockStack).
//!   Monitors are referenced from the header or kept in a [`MonitorTable`].
//!
//! [`ObjectSynchronizer`] sits on top and is what callers use.

use std::{fmt, pin::Pin};

use crate::{
    objectmodel::{header::LockStateWord, ObjectReference},
    runtime::threads::{ThreadContext, ThreadId, Threads},
};

pub mod basic_lock;
pub mod legacy;
pub mod lightweight;
pub mod lock_stack;
pub mod monitor_table;
pub mod object_monitor;
pub mod synchronizer;

pub use basic_lock::BasicLock;
pub use monitor_table::{MonitorList, MonitorTable};
pub use object_monitor::ObjectMonitor;
pub use synchronizer::ObjectSynchronizer;

/// One locking algorithm.
///
/// Callers go through [`ObjectSynchronizer`], which does the bookkeeping
/// common to both algorithms (held-monitor count, null and value-based
/// checks, the no-safepoint region around `quick_enter`).
pub trait LockingBackend {
    /// Blocks until `thread` owns `object`.
    fn enter(&self, object: ObjectReference, lock: Pin<&BasicLock>, thread: &ThreadContext);

    /// Acquires `object` without blocking, allocating or reaching a
    /// safepoint. On failure nothing has changed.
    fn quick_enter(
        &self,
        object: ObjectReference,
        thread: &ThreadContext,
        lock: Pin<&BasicLock>,
    ) -> bool;

    /// Releases one level of ownership. `lock` is the record used to enter.
    fn exit(&self, object: ObjectReference, lock: Pin<&BasicLock>, thread: &ThreadContext);

    /// Monitor associated with `object`, given its current header `mark`.
    fn read_monitor(
        &self,
        thread: &ThreadContext,
        object: ObjectReference,
        mark: LockStateWord,
    ) -> Option<&ObjectMonitor>;

    fn identity_hash(&self, object: ObjectReference, thread: &ThreadContext) -> u32;

    fn holds_lock(&self, thread: &ThreadContext, object: ObjectReference) -> bool;

    fn lock_owner(&self, threads: &Threads, object: ObjectReference) -> Option<ThreadId>;

    /// Number of monitors inflated so far.
    fn monitor_count(&self) -> usize;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InflateCause {
    MonitorEnter,
    HashCode,
    LockStackFull,
    RecursionDepth,
    RecordRegistryFull,
    HeavyMonitors,
}

impl fmt::Display for InflateCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MonitorEnter => "monitor enter",
            Self::HashCode => "identity hash",
            Self::LockStackFull => "lock stack full",
            Self::RecursionDepth => "recursion depth",
            Self::RecordRegistryFull => "lock record registry full",
            Self::HeavyMonitors => "heavy monitors only",
        })
    }
}

/// Decodes a monitor address kept in the header.
///
/// # Safety
///
/// `mark` must have been read from the header of an object whose monitors
/// are owned by a synchronizer that outlives `'a`.
pub(crate) unsafe fn monitor_from_mark<'a>(mark: LockStateWord) -> &'a ObjectMonitor {
    &*mark.monitor_ptr()
}

/// Exit of a lock the thread does not hold. Fatal in debug builds; release
/// builds log it and leave the lock alone.
#[cold]
pub(crate) fn illegal_exit(object: ObjectReference, thread: &ThreadContext) {
    log::error!(
        target: "objsync::exit",
        "{} exits {:?} without owning it",
        thread.id(),
        object
    );
    if cfg!(debug_assertions) {
        panic!("{} exits {:?} without owning it", thread.id(), object);
    }
}
