use std::{pin::Pin, sync::Arc};

use crate::{
    objectmodel::{header::LockStateWord, reference::Handle, ObjectReference},
    options::{LockingMode, SyncOptions},
    runtime::{
        safepoint::NoSafepointVerifier,
        threads::{ThreadContext, ThreadId, ThreadState, Threads},
    },
};

use super::{
    basic_lock::BasicLock, legacy::LegacySynchronizer, lightweight::LightweightSynchronizer,
    monitor_from_mark, object_monitor::ObjectMonitor, LockingBackend,
};

/// The locking algorithm picked for this runtime.
pub enum Backend {
    Legacy(LegacySynchronizer),
    Lightweight(LightweightSynchronizer),
}

impl Backend {
    fn get(&self) -> &dyn LockingBackend {
        match self {
            Self::Legacy(legacy) => legacy,
            Self::Lightweight(lightweight) => lightweight,
        }
    }
}

/// Entry point for monitor enter and exit.
///
/// Owns every monitor it inflates; monitors are freed when the synchronizer
/// is dropped. Objects passed in must come from the heap of the same runtime.
pub struct ObjectSynchronizer {
    backend: Backend,
    options: SyncOptions,
    threads: Arc<Threads>,
}

impl ObjectSynchronizer {
    pub fn new(options: SyncOptions, threads: Arc<Threads>) -> Self {
        let backend = match options.locking_mode {
            LockingMode::Lightweight => Backend::Lightweight(LightweightSynchronizer::new(&options)),
            LockingMode::Legacy | LockingMode::Monitor => {
                Backend::Legacy(LegacySynchronizer::new(&options))
            }
        };

        log::info!(
            target: "objsync::options",
            "locking mode: {}, object monitor table: {}",
            options.locking_mode,
            options.use_object_monitor_table
        );

        Self {
            backend,
            options,
            threads,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn locking_mode(&self) -> LockingMode {
        self.options.locking_mode
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Monitor address kept inline in `mark`. Always `None` when monitors are
    /// kept in the monitor table, where headers carry no monitor address.
    pub fn read_monitor_from_mark(&self, mark: LockStateWord) -> Option<&ObjectMonitor> {
        if self.options.use_object_monitor_table {
            return None;
        }
        // SAFETY: marks can only be read from object headers, and monitor
        // marks are only installed by this synchronizer's backend.
        mark.has_monitor().then(|| unsafe { monitor_from_mark(mark) })
    }

    /// Monitor currently associated with `object`, whose header read `mark`.
    /// Never blocks and never reaches a safepoint.
    pub fn read_monitor(
        &self,
        thread: &ThreadContext,
        object: ObjectReference,
        mark: LockStateWord,
    ) -> Option<&ObjectMonitor> {
        if self.options.use_object_monitor_table {
            self.backend.get().read_monitor(thread, object, mark)
        } else {
            self.read_monitor_from_mark(mark)
        }
    }

    /// Acquires `object`, blocking as long as it takes. May inflate the lock
    /// and may reach a safepoint.
    pub fn enter(&self, object: &Handle, lock: Pin<&BasicLock>, thread: &ThreadContext) {
        debug_assert!(thread.is_current(), "must be the current thread");
        thread.check_possible_safepoint();

        let obj = object.resolve();
        if obj.class().is_value_based() {
            log::warn!(
                target: "objsync::monitor",
                "{} synchronizes on {:?}, an instance of a value-based class",
                thread.id(),
                obj
            );
        }

        self.backend.get().enter(obj, lock, thread);
        thread.inc_held_monitor_count();
    }

    /// Best-effort acquisition that never blocks, allocates or reaches a
    /// safepoint. `false` means nothing happened and the caller should fall
    /// back to [`enter`](Self::enter) (or report the null).
    pub fn quick_enter(
        &self,
        object: Option<ObjectReference>,
        thread: &ThreadContext,
        lock: Pin<&BasicLock>,
    ) -> bool {
        debug_assert_eq!(thread.state(), ThreadState::InManaged, "invariant");
        let _nsv = NoSafepointVerifier::new(thread);

        let Some(object) = object else {
            return false;
        };

        if object.class().is_value_based() {
            return false;
        }

        let entered = self.backend.get().quick_enter(object, thread, lock);
        if entered {
            thread.inc_held_monitor_count();
        }
        entered
    }

    /// Releases one level of ownership of `object` entered with `lock`.
    pub fn exit(&self, object: ObjectReference, lock: Pin<&BasicLock>, thread: &ThreadContext) {
        thread.dec_held_monitor_count();
        self.backend.get().exit(object, lock, thread);
    }

    /// Runs `f` while holding the lock of `object`. The lock is released
    /// even if `f` panics.
    pub fn synchronized<R>(
        &self,
        object: &Handle,
        thread: &ThreadContext,
        f: impl FnOnce() -> R,
    ) -> R {
        struct Release<'a> {
            synchronizer: &'a ObjectSynchronizer,
            object: &'a Handle,
            lock: Pin<&'a BasicLock>,
            thread: &'a ThreadContext,
        }

        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.synchronizer
                    .exit(self.object.resolve(), self.lock, self.thread);
            }
        }

        let lock = std::pin::pin!(BasicLock::new());
        let lock = lock.into_ref();
        if !self.quick_enter(Some(object.resolve()), thread, lock) {
            self.enter(object, lock, thread);
        }

        let _release = Release {
            synchronizer: self,
            object,
            lock,
            thread,
        };
        f()
    }

    pub fn identity_hash(&self, object: &Handle, thread: &ThreadContext) -> u32 {
        self.backend.get().identity_hash(object.resolve(), thread)
    }

    pub fn holds_lock(&self, thread: &ThreadContext, object: ObjectReference) -> bool {
        self.backend.get().holds_lock(thread, object)
    }

    /// Thread currently owning `object`, if any. Stale as soon as it returns.
    pub fn lock_owner(&self, object: ObjectReference) -> Option<ThreadId> {
        self.backend.get().lock_owner(&self.threads, object)
    }

    pub fn monitor_count(&self) -> usize {
        self.backend.get().monitor_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRuntime, TEST_OBJECT, VALUE_OBJECT};

    #[test]
    fn enter_exit_leaves_object_unlocked() {
        for runtime in MockRuntime::all() {
            let thread = runtime.attach();
            let object = runtime.heap().allocate(&thread, &TEST_OBJECT);
            let sync = runtime.synchronizer();
            let lock = std::pin::pin!(BasicLock::new());

            sync.enter(&object, lock.as_ref(), &thread);
            assert!(sync.holds_lock(&thread, object.resolve()));
            assert_eq!(thread.held_monitor_count(), 1);
            assert_eq!(sync.lock_owner(object.resolve()), Some(thread.id()));

            sync.exit(object.resolve(), lock.as_ref(), &thread);
            assert!(!sync.holds_lock(&thread, object.resolve()));
            assert_eq!(thread.held_monitor_count(), 0);
            assert_eq!(sync.lock_owner(object.resolve()), None);
        }
    }

    #[test]
    fn quick_enter_rejects_null_and_value_based() {
        for runtime in MockRuntime::all() {
            let thread = runtime.attach();
            let boxed = runtime.heap().allocate(&thread, &VALUE_OBJECT).resolve();
            let sync = runtime.synchronizer();
            let lock = std::pin::pin!(BasicLock::new());

            assert!(!sync.quick_enter(None, &thread, lock.as_ref()));
            let mark = boxed.header().mark();
            assert!(!sync.quick_enter(Some(boxed), &thread, lock.as_ref()));
            assert_eq!(boxed.header().mark(), mark);
            assert_eq!(thread.held_monitor_count(), 0);
        }
    }

    #[test]
    fn read_monitor_after_inflation() {
        for runtime in MockRuntime::all() {
            let thread = runtime.attach();
            let object = runtime.heap().allocate(&thread, &TEST_OBJECT);
            let sync = runtime.synchronizer();
            let obj = object.resolve();

            assert!(sync.read_monitor(&thread, obj, obj.header().mark()).is_none());

            let outer = std::pin::pin!(BasicLock::new());
            let inner = std::pin::pin!(BasicLock::new());
            sync.enter(&object, outer.as_ref(), &thread);
            sync.enter(&object, inner.as_ref(), &thread);

            // Only heavy monitors inflate an uncontended recursive lock.
            let mark = obj.header().mark();
            let monitor = sync.read_monitor(&thread, obj, mark);
            assert_eq!(monitor.is_some(), runtime.locking_mode() == LockingMode::Monitor);
            if let Some(monitor) = monitor {
                assert_eq!(monitor.object(), obj);
                assert!(monitor.is_owner(&thread));
                assert_eq!(monitor.recursions(), 1);
            }

            sync.exit(obj, inner.as_ref(), &thread);
            sync.exit(obj, outer.as_ref(), &thread);
            assert!(!sync.holds_lock(&thread, obj));
        }
    }

    #[test]
    fn inline_decode_refused_in_table_mode() {
        let runtime = MockRuntime::table();
        let thread = runtime.attach();
        let object = runtime.heap().allocate(&thread, &TEST_OBJECT);
        let sync = runtime.synchronizer();
        let obj = object.resolve();

        // Monitor bits with an empty hash field would decode to null.
        let bare = LockStateWord::unlocked().set_has_monitor();
        assert!(bare.has_monitor());
        assert!(sync.read_monitor_from_mark(bare).is_none());

        let hash = sync.identity_hash(&object, &thread);
        let hashed = obj.header().mark().set_has_monitor();
        assert_eq!(hashed.hash().0, hash);
        assert!(sync.read_monitor_from_mark(hashed).is_none());
    }

    #[test]
    fn synchronized_releases_on_panic() {
        for runtime in MockRuntime::all() {
            let thread = runtime.attach();
            let object = runtime.heap().allocate(&thread, &TEST_OBJECT);
            let sync = runtime.synchronizer();

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sync.synchronized(&object, &thread, || {
                    assert!(sync.holds_lock(&thread, object.resolve()));
                    panic!("boom");
                })
            }));
            assert!(result.is_err());
            assert!(!sync.holds_lock(&thread, object.resolve()));
            assert_eq!(thread.held_monitor_count(), 0);
        }
    }
}
