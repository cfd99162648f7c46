//! Lightweight locking.
//!
//! A thread fast-locks an object by flipping its lock bits to `00` and
//! pushing the object on its [`LockStack`](super::lock_stack::LockStack).
//! The rest of the header stays in place, so the identity hash can be read
//! and installed without inflating. Recursion is a repeated entry at the top
//! of the lock stack.
//!
//! When that does not work out (contention, a full lock stack, recursion
//! below the top) the lock is inflated. Monitors are either referenced from
//! the header or, with `use_object_monitor_table`, kept in a
//! [`MonitorTable`] while the header only carries the monitor lock bits. A
//! monitor inflated from a fast-lock of another thread is owned anonymously
//! until that thread claims it.

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
    basic_lock::BasicLock,
    illegal_exit, monitor_from_mark,
    monitor_table::{MonitorList, MonitorTable},
    object_monitor::{ObjectMonitor, ANONYMOUS_OWNER, NO_OWNER},
    InflateCause, LockingBackend,
};

pub struct LightweightSynchronizer {
    table: Option<MonitorTable>,
    monitors: MonitorList,
    monitor_spins: usize,
    fast_lock_spins: usize,
}

impl LightweightSynchronizer {
    pub fn new(options: &SyncOptions) -> Self {
        debug_assert_eq!(options.locking_mode, LockingMode::Lightweight);
        Self {
            table: options.use_object_monitor_table.then(MonitorTable::new),
            monitors: MonitorList::new(),
            monitor_spins: options.monitor_spins,
            fast_lock_spins: options.fast_lock_spins,
        }
    }

    pub fn uses_table(&self) -> bool {
        self.table.is_some()
    }

    fn monitor_for_mark(
        &self,
        object: ObjectReference,
        mark: LockStateWord,
    ) -> Option<&ObjectMonitor> {
        if !mark.has_monitor() {
            return None;
        }

        match &self.table {
            Some(table) => table.get(object),
            // SAFETY: inline monitor marks are only installed by
            // `inflate_inline`, which keeps the monitor in `self.monitors`.
            None => Some(unsafe { monitor_from_mark(mark) }),
        }
    }

    /// Owner and recursion count for a monitor replacing a fast-lock.
    fn fast_lock_owner(thread: &ThreadContext, object: ObjectReference) -> (u64, usize) {
        match thread.lock_stack().count(object.address()) {
            0 => (ANONYMOUS_OWNER, 0),
            held => (thread.id().as_u64(), held - 1),
        }
    }

    /// Returns the monitor of `object`, inflating it first if needed. A
    /// fast-lock held by `thread` is transferred to the monitor.
    pub fn inflate<'a>(
        &'a self,
        thread: &ThreadContext,
        object: ObjectReference,
        cause: InflateCause,
    ) -> &'a ObjectMonitor {
        match &self.table {
            Some(table) => self.inflate_into_table(table, thread, object, cause),
            None => self.inflate_inline(thread, object, cause),
        }
    }

    fn inflate_inline<'a>(
        &'a self,
        thread: &ThreadContext,
        object: ObjectReference,
        cause: InflateCause,
    ) -> &'a ObjectMonitor {
        let header = object.header();

        loop {
            let mark = header.mark();
            if mark.has_monitor() {
                // SAFETY: see `monitor_for_mark`.
                return unsafe { monitor_from_mark(mark) };
            }

            let monitor = Arc::new(ObjectMonitor::new(object, self.monitor_spins));
            let mut owner = NO_OWNER;
            if mark.is_fast_locked() {
                let (fast_owner, recursions) = Self::fast_lock_owner(thread, object);
                owner = fast_owner;
                monitor.set_owner_before_publish(owner, recursions);
                monitor.set_header(mark.set_unlocked());
            } else {
                monitor.set_header(mark);
            }

            let published = LockStateWord::encode_monitor(Arc::as_ptr(&monitor));
            if header.cas_set_mark(published, mark).is_err() {
                continue;
            }

            if owner == thread.id().as_u64() {
                thread.lock_stack().remove(object.address());
            }
            log::debug!(
                target: "objsync::inflate",
                "{} inflated {:?} owned by {} ({})",
                thread.id(),
                object,
                owner,
                cause
            );
            return self.monitors.add(monitor);
        }
    }

    fn inflate_into_table<'a>(
        &'a self,
        table: &'a MonitorTable,
        thread: &ThreadContext,
        object: ObjectReference,
        cause: InflateCause,
    ) -> &'a ObjectMonitor {
        let monitor = table.get_or_insert(object, || {
            ObjectMonitor::new(object, self.monitor_spins)
        });
        let _inflating = monitor.inflation_lock();
        let header = object.header();

        loop {
            let mark = header.mark();
            if mark.has_monitor() {
                return monitor;
            }

            let mut owner = NO_OWNER;
            if mark.is_fast_locked() {
                let (fast_owner, recursions) = Self::fast_lock_owner(thread, object);
                owner = fast_owner;
                monitor.set_owner_before_publish(owner, recursions);
            }

            if header.cas_set_mark(mark.set_has_monitor(), mark).is_err() {
                monitor.set_owner_before_publish(NO_OWNER, 0);
                continue;
            }

            if owner == thread.id().as_u64() {
                thread.lock_stack().remove(object.address());
            }
            log::debug!(
                target: "objsync::inflate",
                "{} inflated {:?} into the monitor table, owned by {} ({})",
                thread.id(),
                object,
                owner,
                cause
            );
            return monitor;
        }
    }

    fn enter_monitor(
        &self,
        monitor: &ObjectMonitor,
        object: ObjectReference,
        lock: Pin<&BasicLock>,
        thread: &ThreadContext,
    ) {
        if monitor.has_anonymous_owner() && thread.lock_stack().contains(object.address()) {
            let held = thread.lock_stack().remove(object.address());
            monitor.set_owner_from_anonymous(thread, held - 1);
        }

        if self.uses_table() {
            lock.set_object_monitor_cache(monitor);
        }
        monitor.enter(thread);
    }
}

impl LockingBackend for LightweightSynchronizer {
    fn enter(&self, object: ObjectReference, lock: Pin<&BasicLock>, thread: &ThreadContext) {
        if self.uses_table() {
            lock.clear_object_monitor_cache();
        }

        let address = object.address();
        let lock_stack = thread.lock_stack();
        if lock_stack.try_recursive_enter(address) {
            return;
        }

        let header = object.header();
        if !lock_stack.is_full() {
            let mut backoff = Backoff::new();
            let mut mark = header.mark();

            for _ in 0..self.fast_lock_spins {
                if mark.is_unlocked() {
                    match header.cas_set_mark(mark.set_fast_locked(), mark) {
                        Ok(_) => {
                            lock_stack.push(address);
                            return;
                        }
                        Err(witness) => {
                            mark = witness;
                            continue;
                        }
                    }
                }

                // Monitor, or a recursive lock below the top of the stack.
                if !mark.is_fast_locked() || lock_stack.contains(address) {
                    break;
                }

                backoff.spin();
                mark = header.mark();
            }
        }

        let cause = if lock_stack.is_full() {
            InflateCause::LockStackFull
        } else {
            InflateCause::MonitorEnter
        };
        let monitor = self.inflate(thread, object, cause);
        self.enter_monitor(monitor, object, lock, thread);
    }

    fn quick_enter(
        &self,
        object: ObjectReference,
        thread: &ThreadContext,
        lock: Pin<&BasicLock>,
    ) -> bool {
        if self.uses_table() {
            lock.clear_object_monitor_cache();
        }

        let address = object.address();
        let lock_stack = thread.lock_stack();
        if lock_stack.try_recursive_enter(address) {
            return true;
        }

        let header = object.header();
        let mark = header.mark();

        if mark.is_unlocked() {
            if !lock_stack.is_full() && header.cas_set_mark(mark.set_fast_locked(), mark).is_ok()
            {
                lock_stack.push(address);
                return true;
            }
            return false;
        }

        if let Some(monitor) = self.monitor_for_mark(object, mark) {
            if monitor.try_enter(thread) {
                if self.uses_table() {
                    lock.set_object_monitor_cache(monitor);
                }
                return true;
            }
        }

        false
    }

    fn exit(&self, object: ObjectReference, lock: Pin<&BasicLock>, thread: &ThreadContext) {
        let address = object.address();
        let lock_stack = thread.lock_stack();
        if lock_stack.try_recursive_exit(address) {
            return;
        }

        let header = object.header();
        let mut mark = header.mark();

        if lock_stack.contains(address) {
            while mark.is_fast_locked() {
                match header.cas_set_mark(mark.set_unlocked(), mark) {
                    Ok(_) => {
                        lock_stack.remove(address);
                        return;
                    }
                    // Hash installed or lock inflated under us.
                    Err(witness) => mark = witness,
                }
            }
        }

        let cached = if self.uses_table() {
            lock.object_monitor_cache()
                .filter(|monitor| monitor.object() == object)
        } else {
            None
        };
        let Some(monitor) = cached.or_else(|| self.monitor_for_mark(object, mark)) else {
            illegal_exit(object, thread);
            return;
        };

        if monitor.has_anonymous_owner() {
            if !lock_stack.contains(address) {
                illegal_exit(object, thread);
                return;
            }
            let held = lock_stack.remove(address);
            monitor.set_owner_from_anonymous(thread, held - 1);
        }

        if !monitor.is_owner(thread) {
            illegal_exit(object, thread);
            return;
        }

        monitor.exit(thread);
    }

    fn read_monitor(
        &self,
        _thread: &ThreadContext,
        object: ObjectReference,
        mark: LockStateWord,
    ) -> Option<&ObjectMonitor> {
        self.monitor_for_mark(object, mark)
    }

    fn identity_hash(&self, object: ObjectReference, thread: &ThreadContext) -> u32 {
        let header = object.header();

        loop {
            let mark = header.mark();

            if mark.has_monitor() && !self.uses_table() {
                // SAFETY: see `monitor_for_mark`.
                let monitor = unsafe { monitor_from_mark(mark) };
                return monitor.identity_hash(thread);
            }

            // Unlocked, fast-locked and table-mode monitor headers all keep
            // the hash bits in place.
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
        }
    }

    fn holds_lock(&self, thread: &ThreadContext, object: ObjectReference) -> bool {
        let mark = object.header().mark();
        let on_lock_stack = thread.lock_stack().contains(object.address());

        if mark.is_fast_locked() {
            return on_lock_stack;
        }

        match self.monitor_for_mark(object, mark) {
            Some(monitor) => {
                monitor.is_owner(thread) || (monitor.has_anonymous_owner() && on_lock_stack)
            }
            None => false,
        }
    }

    fn lock_owner(&self, threads: &Threads, object: ObjectReference) -> Option<ThreadId> {
        let address = object.address();
        let mark = object.header().mark();
        let fast_locker = || threads.find(|thread| thread.lock_stack().contains(address));

        if mark.is_fast_locked() {
            return fast_locker();
        }

        let monitor = self.monitor_for_mark(object, mark)?;
        if monitor.has_anonymous_owner() {
            fast_locker()
        } else {
            monitor.owner()
        }
    }

    fn monitor_count(&self) -> usize {
        match &self.table {
            Some(table) => table.len(),
            None => self.monitors.len(),
        }
    }
}
