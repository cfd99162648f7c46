//! Stack-locking.
//!
//! Locking an unlocked object copies its header into the caller's
//! [`BasicLock`] and CASes the header to the record's address. Recursive
//! locks by the owner get a record with a zero displaced header and leave the
//! header alone. Every record a thread stack-locks with is registered in its
//! `lock_records`, which is how a thread recognizes a header pointing at one
//! of its own records.
//!
//! Anything else (contention, hashing a lock held by another thread, too
//! many records) inflates the lock into an [`ObjectMonitor`]. Inflating a
//! stack-locked object first parks the header at [`LockStateWord::INFLATING`],
//! which keeps the owner from finishing its exit while the displaced header
//! is copied out of its record.
//!
//! [`LockingMode::Monitor`](crate::options::LockingMode::Monitor) skips
//! stack-locking and inflates on first use.

use std::{pin::Pin, sync::Arc};

use crate::{
    objectmodel::{
        header::{IdentityHash, LockStateWord},
        ObjectReference,
    },
    options::{LockingMode, SyncOptions},
    runtime::threads::{ThreadContext, ThreadId, Threads},
    utils::Backoff,
};

use super::{
    basic_lock::BasicLock, illegal_exit, monitor_from_mark, monitor_table::MonitorList,
    object_monitor::ObjectMonitor, InflateCause, LockingBackend,
};

pub struct LegacySynchronizer {
    heavy_monitors: bool,
    monitor_spins: usize,
    monitors: MonitorList,
}

impl LegacySynchronizer {
    pub fn new(options: &SyncOptions) -> Self {
        debug_assert!(matches!(
            options.locking_mode,
            LockingMode::Legacy | LockingMode::Monitor
        ));
        Self {
            heavy_monitors: options.locking_mode == LockingMode::Monitor,
            monitor_spins: options.monitor_spins,
            monitors: MonitorList::new(),
        }
    }

    fn monitor<'a>(&'a self, mark: LockStateWord) -> &'a ObjectMonitor {
        // SAFETY: monitor marks are only installed by `inflate`, and the
        // monitor is kept in `self.monitors`.
        unsafe { monitor_from_mark(mark) }
    }

    /// Waits out a concurrent inflation.
    fn read_stable_mark(object: ObjectReference) -> LockStateWord {
        let header = object.header();
        let mut backoff = Backoff::new();
        loop {
            let mark = header.mark();
            if !mark.is_inflating() {
                return mark;
            }
            backoff.snooze();
        }
    }

    /// Returns the monitor of `object`, inflating it first if needed.
    pub fn inflate<'a>(
        &'a self,
        thread: &ThreadContext,
        object: ObjectReference,
        cause: InflateCause,
    ) -> &'a ObjectMonitor {
        let header = object.header();

        loop {
            let mark = Self::read_stable_mark(object);
            if mark.has_monitor() {
                return self.monitor(mark);
            }

            let monitor = Arc::new(ObjectMonitor::new(object, self.monitor_spins));

            if mark.is_stack_locked() {
                if header.cas_set_mark(LockStateWord::INFLATING, mark).is_err() {
                    continue;
                }

                // SAFETY: the owner cannot leave its exit path while the
                // header reads INFLATING, so its record is still alive.
                let record = unsafe { BasicLock::from_address(mark.locker()) };
                let owner = record.owner();
                monitor.set_header(record.displaced_header());
                monitor.set_owner_before_publish(owner.as_u64(), 0);

                let monitor = self.monitors.add(monitor);
                header.release_set_mark(LockStateWord::encode_monitor(monitor));
                log::debug!(
                    target: "objsync::inflate",
                    "{} inflated {:?} stack-locked by {} ({})",
                    thread.id(),
                    object,
                    owner,
                    cause
                );
                return monitor;
            }

            debug_assert!(mark.is_unlocked(), "unexpected mark {:?}", mark);
            monitor.set_header(mark);
            let published = LockStateWord::encode_monitor(Arc::as_ptr(&monitor));
            if header.cas_set_mark(published, mark).is_err() {
                continue;
            }

            let monitor = self.monitors.add(monitor);
            log::debug!(
                target: "objsync::inflate",
                "{} inflated unlocked {:?} ({})",
                thread.id(),
                object,
                cause
            );
            return monitor;
        }
    }

    fn try_stack_lock(
        &self,
        object: ObjectReference,
        lock: Pin<&BasicLock>,
        thread: &ThreadContext,
    ) -> Result<(), InflateCause> {
        let header = object.header();
        let records = thread.lock_records();
        let mark = header.mark();

        if mark.is_unlocked() {
            if records.is_full() {
                return Err(InflateCause::RecordRegistryFull);
            }

            lock.set_displaced_header(mark);
            lock.set_owner(thread.id());
            let locked = LockStateWord::encode_stack_lock(lock.address());
            if header.cas_set_mark(locked, mark).is_ok() {
                records.push(lock.address());
                return Ok(());
            }
        } else if mark.is_stack_locked() && thread.is_lock_owned(mark.locker()) {
            if records.is_full() {
                return Err(InflateCause::RecursionDepth);
            }

            lock.set_recursive();
            lock.set_owner(thread.id());
            records.push(lock.address());
            return Ok(());
        }

        Err(InflateCause::MonitorEnter)
    }
}

impl LockingBackend for LegacySynchronizer {
    fn enter(&self, object: ObjectReference, lock: Pin<&BasicLock>, thread: &ThreadContext) {
        let cause = if self.heavy_monitors {
            InflateCause::HeavyMonitors
        } else {
            match self.try_stack_lock(object, lock, thread) {
                Ok(()) => return,
                Err(cause) => cause,
            }
        };

        // The record stays unused; exit recognizes it by this marker.
        lock.set_displaced_header(LockStateWord::UNUSED_MARK);
        self.inflate(thread, object, cause).enter(thread);
    }

    fn quick_enter(
        &self,
        object: ObjectReference,
        thread: &ThreadContext,
        lock: Pin<&BasicLock>,
    ) -> bool {
        let mark = object.header().mark();
        if !mark.has_monitor() {
            return false;
        }

        if self.monitor(mark).try_enter(thread) {
            lock.set_displaced_header(LockStateWord::UNUSED_MARK);
            return true;
        }

        false
    }

    fn exit(&self, object: ObjectReference, lock: Pin<&BasicLock>, thread: &ThreadContext) {
        let header = object.header();

        if !self.heavy_monitors {
            if lock.is_recursive() {
                // Recursive stack-lock, the header belongs to an outer record.
                if thread.lock_records().remove(lock.address()) == 0 {
                    illegal_exit(object, thread);
                }
                return;
            }

            let displaced = lock.displaced_header();
            if displaced != LockStateWord::UNUSED_MARK {
                let mark = header.mark();
                if mark == LockStateWord::encode_stack_lock(lock.address())
                    && header.cas_set_mark(displaced, mark).is_ok()
                {
                    thread.lock_records().remove(lock.address());
                    return;
                }
            }
        }

        // Inflated, possibly while this thread held it stack-locked.
        let mark = Self::read_stable_mark(object);
        thread.lock_records().remove(lock.address());

        if !mark.has_monitor() {
            illegal_exit(object, thread);
            return;
        }

        let monitor = self.monitor(mark);
        if !monitor.is_owner(thread) {
            illegal_exit(object, thread);
            return;
        }

        monitor.exit(thread);
    }

    fn read_monitor(
        &self,
        _thread: &ThreadContext,
        _object: ObjectReference,
        mark: LockStateWord,
    ) -> Option<&ObjectMonitor> {
        mark.has_monitor().then(|| self.monitor(mark))
    }

    fn identity_hash(&self, object: ObjectReference, thread: &ThreadContext) -> u32 {
        let header = object.header();

        loop {
            let mark = Self::read_stable_mark(object);

            if mark.is_unlocked() {
                if mark.has_hash() {
                    return mark.hash().0;
                }

                let hash = thread.next_hash();
                if header
                    .cas_set_mark(mark.copy_set_hash(IdentityHash(hash)), mark)
                    .is_ok()
                {
                    return hash;
                }
                continue;
            }

            if mark.has_monitor() {
                return self.monitor(mark).identity_hash(thread);
            }

            if thread.is_lock_owned(mark.locker()) {
                // SAFETY: one of this thread's own live records.
                let displaced = unsafe { BasicLock::from_address(mark.locker()) }.displaced_header();
                if displaced.has_hash() {
                    return displaced.hash().0;
                }
            }

            // The displaced header of a stack-lock can only be changed by its
            // owner, so hashing goes through a monitor.
            let monitor = self.inflate(thread, object, InflateCause::HashCode);
            return monitor.identity_hash(thread);
        }
    }

    fn holds_lock(&self, thread: &ThreadContext, object: ObjectReference) -> bool {
        let mark = Self::read_stable_mark(object);
        if mark.is_stack_locked() {
            thread.is_lock_owned(mark.locker())
        } else if mark.has_monitor() {
            self.monitor(mark).is_owner(thread)
        } else {
            false
        }
    }

    fn lock_owner(&self, threads: &Threads, object: ObjectReference) -> Option<ThreadId> {
        let mark = Self::read_stable_mark(object);
        if mark.is_stack_locked() {
            let record = mark.locker();
            threads.find(|thread| thread.lock_records().contains(record))
        } else if mark.has_monitor() {
            self.monitor(mark).owner()
        } else {
            None
        }
    }

    fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}
