//! Heavyweight monitor backing an inflated lock.
//!
//! Ownership is a single atomic word. Uncontended acquisition is a CAS on it;
//! contended threads queue up FIFO under `entry_queue` and are handed
//! ownership directly by the exiting owner, so a queued thread is never
//! overtaken more than once.

use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    objectmodel::{
        header::{IdentityHash, LockStateWord},
        ObjectReference,
    },
    runtime::threads::{ThreadContext, ThreadId},
    utils::Backoff,
};

pub const NO_OWNER: u64 = 0;
/// Owner of a monitor inflated from a fast-lock held by some other thread.
/// The real owner claims the monitor the next time it touches it.
pub const ANONYMOUS_OWNER: u64 = 1;

pub struct ObjectMonitor {
    /// Backward object pointer
    object: ObjectReference,
    owner: AtomicU64,
    /// thread id of the previous owner of the monitor
    previous_owner_tid: AtomicU64,
    recursions: AtomicUsize,
    /// Displaced header when the monitor is referenced from the object header.
    header: AtomicUsize,
    queued: AtomicUsize,
    entry_queue: Mutex<VecDeque<u64>>,
    entry_cv: Condvar,
    contentions: AtomicUsize,
    spins: usize,
    /// Serializes table-mode inflation of `object`.
    inflation_lock: Mutex<()>,
}

impl ObjectMonitor {
    pub fn new(object: ObjectReference, spins: usize) -> Self {
        Self {
            object,
            owner: AtomicU64::new(NO_OWNER),
            previous_owner_tid: AtomicU64::new(NO_OWNER),
            recursions: AtomicUsize::new(0),
            header: AtomicUsize::new(LockStateWord::unlocked().value()),
            queued: AtomicUsize::new(0),
            entry_queue: Mutex::new(VecDeque::new()),
            entry_cv: Condvar::new(),
            contentions: AtomicUsize::new(0),
            spins,
            inflation_lock: Mutex::new(()),
        }
    }

    pub fn object(&self) -> ObjectReference {
        self.object
    }

    pub fn header(&self) -> LockStateWord {
        LockStateWord::from_raw(self.header.load(Ordering::Acquire))
    }

    pub fn set_header(&self, mark: LockStateWord) {
        self.header.store(mark.value(), Ordering::Release);
    }

    pub fn cas_header(
        &self,
        new: LockStateWord,
        expected: LockStateWord,
    ) -> Result<LockStateWord, LockStateWord> {
        self.header
            .compare_exchange(
                expected.value(),
                new.value(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(LockStateWord::from_raw)
            .map_err(LockStateWord::from_raw)
    }

    /// Hash kept in the displaced header, installed on first use.
    pub fn identity_hash(&self, thread: &ThreadContext) -> u32 {
        loop {
            let header = self.header();
            if header.has_hash() {
                return header.hash().0;
            }

            let hash = thread.next_hash();
            if self
                .cas_header(header.copy_set_hash(IdentityHash(hash)), header)
                .is_ok()
            {
                return hash;
            }
        }
    }

    pub fn owner_raw(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner_raw() {
            NO_OWNER | ANONYMOUS_OWNER => None,
            id => Some(ThreadId::from_raw(id)),
        }
    }

    pub fn is_owner(&self, thread: &ThreadContext) -> bool {
        self.owner_raw() == thread.id().as_u64()
    }

    pub fn is_owned(&self) -> bool {
        self.owner_raw() != NO_OWNER
    }

    pub fn has_anonymous_owner(&self) -> bool {
        self.owner_raw() == ANONYMOUS_OWNER
    }

    pub fn previous_owner(&self) -> Option<ThreadId> {
        match self.previous_owner_tid.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(ThreadId::from_raw(id)),
        }
    }

    pub fn recursions(&self) -> usize {
        self.recursions.load(Ordering::Relaxed)
    }

    pub fn contentions(&self) -> usize {
        self.contentions.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn inflation_lock(&self) -> MutexGuard<'_, ()> {
        self.inflation_lock.lock()
    }

    /// Sets the owner of a monitor nobody else can see yet.
    pub(crate) fn set_owner_before_publish(&self, owner: u64, recursions: usize) {
        self.owner.store(owner, Ordering::Relaxed);
        self.recursions.store(recursions, Ordering::Relaxed);
    }

    pub fn set_owner_from_anonymous(&self, thread: &ThreadContext, recursions: usize) {
        let claimed = self.owner.compare_exchange(
            ANONYMOUS_OWNER,
            thread.id().as_u64(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        assert!(claimed.is_ok(), "monitor is not anonymously owned");
        self.recursions.store(recursions, Ordering::Relaxed);
    }

    fn try_lock_uncontended(&self, me: u64) -> bool {
        self.queued.load(Ordering::Relaxed) == 0
            && self
                .owner
                .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Never blocks and never allocates.
    pub fn try_enter(&self, thread: &ThreadContext) -> bool {
        let me = thread.id().as_u64();
        if self.owner_raw() == me {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.try_lock_uncontended(me)
    }

    pub fn enter(&self, thread: &ThreadContext) {
        let me = thread.id().as_u64();
        if self.owner_raw() == me {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.try_lock_uncontended(me) {
            return;
        }

        let mut backoff = Backoff::new();
        for _ in 0..self.spins {
            backoff.spin();
            if self.try_lock_uncontended(me) {
                return;
            }
        }

        self.contentions.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            target: "objsync::monitor",
            "{} blocks on {:?} owned by {}",
            thread.id(),
            self.object,
            self.owner_raw()
        );

        thread.block_in_vm(|| self.enter_blocked(me));
        debug_assert_eq!(self.owner_raw(), me);
    }

    fn enter_blocked(&self, me: u64) {
        let mut queue = self.entry_queue.lock();

        self.queued.fetch_add(1, Ordering::SeqCst);
        if queue.is_empty()
            && self
                .owner
                .compare_exchange(NO_OWNER, me, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
        {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        queue.push_back(me);
        while self.owner.load(Ordering::Acquire) != me {
            self.entry_cv.wait(&mut queue);
        }
    }

    /// Caller must be the owner.
    pub fn exit(&self, thread: &ThreadContext) {
        let me = thread.id().as_u64();
        debug_assert_eq!(self.owner_raw(), me, "exit of a monitor not owned by {}", thread.id());

        let recursions = self.recursions.load(Ordering::Relaxed);
        if recursions > 0 {
            self.recursions.store(recursions - 1, Ordering::Relaxed);
            return;
        }

        self.previous_owner_tid.store(me, Ordering::Relaxed);
        self.owner.store(NO_OWNER, Ordering::SeqCst);
        if self.queued.load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut queue = self.entry_queue.lock();
        if self.owner.load(Ordering::Relaxed) != NO_OWNER {
            // Re-acquired in the meantime; the new owner hands off on its exit.
            return;
        }

        if let Some(next) = queue.pop_front() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.owner.store(next, Ordering::Release);
            self.entry_cv.notify_all();
        }
    }
}

impl fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("object", &self.object)
            .field("owner", &self.owner_raw())
            .field("recursions", &self.recursions())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;
    use crate::mock::{MockRuntime, TEST_OBJECT};

    #[test]
    fn recursive_enter_and_exit() {
        let runtime = MockRuntime::lightweight();
        let thread = runtime.attach();
        let object = runtime.heap().allocate(&thread, &TEST_OBJECT).resolve();
        let monitor = ObjectMonitor::new(object, 0);

        monitor.enter(&thread);
        monitor.enter(&thread);
        assert!(monitor.is_owner(&thread));
        assert_eq!(monitor.recursions(), 1);

        monitor.exit(&thread);
        assert!(monitor.is_owner(&thread));
        monitor.exit(&thread);
        assert!(!monitor.is_owned());
        assert_eq!(monitor.previous_owner(), Some(thread.id()));
    }

    #[test]
    fn claim_from_anonymous() {
        let runtime = MockRuntime::lightweight();
        let thread = runtime.attach();
        let object = runtime.heap().allocate(&thread, &TEST_OBJECT).resolve();
        let monitor = ObjectMonitor::new(object, 0);

        monitor.set_owner_before_publish(ANONYMOUS_OWNER, 0);
        assert!(monitor.has_anonymous_owner());
        assert_eq!(monitor.owner(), None);
        assert!(!monitor.try_enter(&thread));

        monitor.set_owner_from_anonymous(&thread, 2);
        assert!(monitor.is_owner(&thread));
        assert_eq!(monitor.recursions(), 2);
    }

    #[test]
    fn hands_off_to_waiter() {
        let runtime = MockRuntime::lightweight();
        let main = runtime.attach();
        let object = runtime.heap().allocate(&main, &TEST_OBJECT).resolve();
        let monitor = Arc::new(ObjectMonitor::new(object, 0));
        let acquired = Arc::new(AtomicBool::new(false));

        monitor.enter(&main);

        let waiter = {
            let runtime = runtime.clone();
            let monitor = monitor.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let thread = runtime.attach();
                monitor.enter(&thread);
                acquired.store(true, Ordering::SeqCst);
                monitor.exit(&thread);
            })
        };

        while monitor.queued() == 0 {
            std::thread::yield_now();
        }
        assert!(!acquired.load(Ordering::SeqCst));
        monitor.exit(&main);

        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(!monitor.is_owned());
        assert_eq!(monitor.contentions(), 1);
    }
}
