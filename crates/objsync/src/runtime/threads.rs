use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{objectmodel::header::HASH_MASK, sync::lock_stack::LockStack};

use super::safepoint::{Barrier, SafepointScope};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Ids 0 and 1 are reserved for "no owner" and "anonymous owner".
    pub const FIRST: u64 = 2;

    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    /// Running managed code that holds raw object references.
    InManaged = 1,
    /// Running runtime code that may still touch objects.
    InVm = 2,
    /// Waiting on a monitor or a runtime lock.
    Blocked = 3,
    /// Running native code that does not touch the heap.
    InNative = 4,
    /// Parked at a safepoint barrier.
    AtSafepoint = 5,
    Terminated = 6,
}

impl ThreadState {
    /// States in which the thread does not touch raw object references.
    pub fn is_safe(self) -> bool {
        matches!(
            self,
            Self::New | Self::Blocked | Self::InNative | Self::AtSafepoint | Self::Terminated
        )
    }
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::New,
            1 => ThreadState::InManaged,
            2 => ThreadState::InVm,
            3 => ThreadState::Blocked,
            4 => ThreadState::InNative,
            5 => ThreadState::AtSafepoint,
            6 => ThreadState::Terminated,
            _ => unreachable!(),
        }
    }
}

/// The part of a thread other threads may look at.
pub struct ThreadShared {
    id: ThreadId,
    state: AtomicU8,
    lock_stack: LockStack,
    lock_records: LockStack,
}

impl ThreadShared {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Objects fast-locked by this thread (lightweight locking).
    pub fn lock_stack(&self) -> &LockStack {
        &self.lock_stack
    }

    /// Addresses of the `BasicLock`s this thread stack-locked with (legacy
    /// locking).
    pub fn lock_records(&self) -> &LockStack {
        &self.lock_records
    }
}

thread_local! {
    static CURRENT: Cell<u64> = const { Cell::new(0) };
}

/// Per-thread runtime state. Created by attaching an OS thread and only
/// usable on that thread.
pub struct ThreadContext {
    shared: Arc<ThreadShared>,
    threads: Arc<Threads>,
    held_monitor_count: Cell<usize>,
    #[cfg(debug_assertions)]
    no_safepoint_depth: Cell<usize>,
    hash_state: Cell<[u32; 4]>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadContext {
    pub(crate) fn attach(threads: Arc<Threads>) -> Self {
        let id = threads.next_thread_id();
        CURRENT.with(|current| {
            assert_eq!(
                current.get(),
                0,
                "thread is already attached as thread#{}",
                current.get()
            );
            current.set(id.as_u64());
        });

        let shared = Arc::new(ThreadShared {
            id,
            state: AtomicU8::new(ThreadState::New as u8),
            lock_stack: LockStack::new(),
            lock_records: LockStack::new(),
        });
        threads.add_thread(shared.clone());

        let thread = Self {
            shared,
            threads,
            held_monitor_count: Cell::new(0),
            #[cfg(debug_assertions)]
            no_safepoint_depth: Cell::new(0),
            // Marsaglia xor-shift, seeded per thread
            hash_state: Cell::new([
                (id.as_u64() as u32).wrapping_mul(0x9e37_79b9) ^ 0x5bd1_e995,
                842502087,
                0x8767,
                273326509,
            ]),
            _not_send: PhantomData,
        };

        thread.leave_safe_state(ThreadState::InManaged);
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.shared.id
    }

    pub fn shared(&self) -> &ThreadShared {
        &self.shared
    }

    pub fn threads(&self) -> &Arc<Threads> {
        &self.threads
    }

    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.get() == self.id().as_u64())
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    pub fn lock_stack(&self) -> &LockStack {
        &self.shared.lock_stack
    }

    pub fn lock_records(&self) -> &LockStack {
        &self.shared.lock_records
    }

    /// Whether `record` is one of this thread's live stack-lock records.
    pub fn is_lock_owned(&self, record: usize) -> bool {
        self.shared.lock_records.contains(record)
    }

    pub fn held_monitor_count(&self) -> usize {
        self.held_monitor_count.get()
    }

    pub(crate) fn inc_held_monitor_count(&self) {
        self.held_monitor_count.set(self.held_monitor_count.get() + 1);
    }

    pub(crate) fn dec_held_monitor_count(&self) {
        self.held_monitor_count
            .set(self.held_monitor_count.get().saturating_sub(1));
    }

    /// Next non-zero identity hash for this thread.
    pub(crate) fn next_hash(&self) -> u32 {
        let [mut x, mut y, mut z, mut w] = self.hash_state.get();
        loop {
            let t = x ^ (x << 11);
            x = y;
            y = z;
            z = w;
            w = (w ^ (w >> 19)) ^ (t ^ (t >> 8));

            let hash = w & HASH_MASK;
            if hash != 0 {
                self.hash_state.set([x, y, z, w]);
                return hash;
            }
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn no_safepoint_depth(&self) -> &Cell<usize> {
        &self.no_safepoint_depth
    }

    /// Panics in debug builds when called inside a no-safepoint region.
    pub fn check_possible_safepoint(&self) {
        #[cfg(debug_assertions)]
        assert_eq!(
            self.no_safepoint_depth.get(),
            0,
            "possible safepoint inside a no-safepoint region"
        );
    }

    fn leave_safe_state(&self, state: ThreadState) {
        loop {
            self.shared.set_state(state);
            if !self.threads.safepoint_requested() {
                return;
            }

            self.shared.set_state(ThreadState::AtSafepoint);
            self.threads.barrier.wait_in_safepoint();
        }
    }

    /// Parks at the barrier if a safepoint is pending.
    pub fn poll_safepoint(&self) {
        self.check_possible_safepoint();
        if self.threads.safepoint_requested() {
            let state = self.state();
            self.shared.set_state(ThreadState::AtSafepoint);
            self.threads.barrier.wait_in_safepoint();
            self.leave_safe_state(state);
        }
    }

    /// Runs `f` in the [`Blocked`](ThreadState::Blocked) state, so that
    /// safepoints can proceed while `f` waits. `f` must not touch raw
    /// object references.
    pub fn block_in_vm<R>(&self, f: impl FnOnce() -> R) -> R {
        self.check_possible_safepoint();
        let state = self.state();
        self.shared.set_state(ThreadState::Blocked);
        let result = f();
        self.leave_safe_state(state);
        result
    }

    /// Same as [`block_in_vm`](Self::block_in_vm) for native code.
    pub fn in_native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.check_possible_safepoint();
        let state = self.state();
        self.shared.set_state(ThreadState::InNative);
        let result = f();
        self.leave_safe_state(state);
        result
    }

    /// Stops every other attached thread until the scope is dropped.
    pub fn safepoint(&self) -> SafepointScope<'_> {
        self.check_possible_safepoint();
        let serialize = self.block_in_vm(|| self.threads.safepoint_lock.lock());
        SafepointScope::begin(&self.threads, serialize, Some(self.id()))
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.shared.set_state(ThreadState::Terminated);
        self.threads.remove_thread(self.id());
        CURRENT.with(|current| current.set(0));
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("held_monitor_count", &self.held_monitor_count())
            .finish()
    }
}

pub struct Threads {
    threads: Mutex<Vec<Arc<ThreadShared>>>,
    next_thread_id: AtomicU64,
    safepoint_requested: AtomicBool,
    pub(crate) safepoint_lock: Mutex<()>,
    pub(crate) barrier: Barrier,
}

impl Threads {
    pub const fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicU64::new(ThreadId::FIRST),
            safepoint_requested: AtomicBool::new(false),
            safepoint_lock: Mutex::new(()),
            barrier: Barrier::new(),
        }
    }

    fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed))
    }

    fn add_thread(&self, thread: Arc<ThreadShared>) {
        self.threads.lock().push(thread);
    }

    fn remove_thread(&self, id: ThreadId) {
        let mut threads = self.threads.lock();
        if let Some(ix) = threads.iter().position(|thread| thread.id == id) {
            threads.swap_remove(ix);
        }
    }

    pub fn count(&self) -> usize {
        self.threads.lock().len()
    }

    /// First registered thread matching `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&ThreadShared) -> bool) -> Option<ThreadId> {
        self.threads
            .lock()
            .iter()
            .find(|thread| predicate(thread))
            .map(|thread| thread.id)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ThreadShared>> {
        self.threads.lock().clone()
    }

    pub fn safepoint_requested(&self) -> bool {
        self.safepoint_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_safepoint_requested(&self, value: bool) {
        self.safepoint_requested.store(value, Ordering::SeqCst);
    }

    /// Stops every attached thread until the scope is dropped. For use by
    /// threads that are not attached; attached threads use
    /// [`ThreadContext::safepoint`].
    pub fn safepoint(&self) -> SafepointScope<'_> {
        let serialize = self.safepoint_lock.lock();
        SafepointScope::begin(self, serialize, None)
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}
