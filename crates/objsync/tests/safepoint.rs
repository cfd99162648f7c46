use std::{
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use objsync::{
    mock::{MockRuntime, TEST_OBJECT},
    runtime::{safepoint::NoSafepointVerifier, threads::ThreadState},
    sync::BasicLock,
    LockingMode,
};

#[test]
fn safepoint_proceeds_while_thread_waits_on_monitor() {
    for runtime in MockRuntime::all() {
        let thread = runtime.attach();
        let object = runtime.allocate(&thread, &TEST_OBJECT);
        let acquired = Arc::new(AtomicBool::new(false));
        let lock = pin!(BasicLock::new());

        runtime.synchronizer().enter(&object, lock.as_ref(), &thread);

        let waiter = {
            let object = object.clone();
            let acquired = acquired.clone();
            let runtime2 = runtime.clone();
            runtime.spawn(move |thread| {
                let sync = runtime2.synchronizer();
                let lock = pin!(BasicLock::new());
                sync.enter(&object, lock.as_ref(), thread);
                acquired.store(true, Ordering::SeqCst);
                sync.exit(object.resolve(), lock.as_ref(), thread);
                thread.id()
            })
        };

        let waiter_id = loop {
            let blocked = runtime
                .threads()
                .find(|other| other.id() != thread.id() && other.state() == ThreadState::Blocked);
            if let Some(id) = blocked {
                break id;
            }
            std::thread::yield_now();
        };

        {
            let scope = thread.safepoint();
            assert!(runtime.threads().safepoint_requested());
            let states = scope.thread_states();
            assert!(states.contains(&(waiter_id, ThreadState::Blocked)));
            assert!(!acquired.load(Ordering::SeqCst));
        }
        assert!(!runtime.threads().safepoint_requested());

        runtime
            .synchronizer()
            .exit(object.resolve(), lock.as_ref(), &thread);
        let joined = thread.block_in_vm(|| waiter.join().unwrap());
        assert_eq!(joined, waiter_id);
        assert!(acquired.load(Ordering::SeqCst), "{}", runtime.describe());
    }
}

#[test]
fn owner_parks_at_safepoint_after_handoff() {
    let runtime = MockRuntime::lightweight();
    let thread = runtime.attach();
    let object = runtime.allocate(&thread, &TEST_OBJECT);
    let lock = pin!(BasicLock::new());

    runtime.synchronizer().enter(&object, lock.as_ref(), &thread);

    let waiter = {
        let object = object.clone();
        let runtime2 = runtime.clone();
        runtime.spawn(move |thread| {
            let sync = runtime2.synchronizer();
            let lock = pin!(BasicLock::new());
            sync.enter(&object, lock.as_ref(), thread);
            let owner = sync.holds_lock(thread, object.resolve());
            sync.exit(object.resolve(), lock.as_ref(), thread);
            owner
        })
    };

    while runtime
        .threads()
        .find(|other| other.id() != thread.id() && other.state() == ThreadState::Blocked)
        .is_none()
    {
        std::thread::yield_now();
    }

    {
        let _scope = thread.safepoint();
        // Hand-off happens inside the safepoint; the waiter owns the monitor
        // but cannot run managed code until the scope ends.
        runtime
            .synchronizer()
            .exit(object.resolve(), lock.as_ref(), &thread);
        assert_ne!(
            runtime.synchronizer().lock_owner(object.resolve()),
            Some(thread.id())
        );
    }

    assert!(thread.block_in_vm(|| waiter.join().unwrap()));
    assert_eq!(runtime.synchronizer().lock_owner(object.resolve()), None);
}

#[test]
fn quick_enter_inside_no_safepoint_region() {
    for runtime in MockRuntime::all() {
        let thread = runtime.attach();
        let object = runtime.allocate(&thread, &TEST_OBJECT);
        let sync = runtime.synchronizer();
        let lock = pin!(BasicLock::new());

        let entered = {
            let _nsv = NoSafepointVerifier::new(&thread);
            sync.quick_enter(Some(object.resolve()), &thread, lock.as_ref())
        };

        if entered {
            sync.exit(object.resolve(), lock.as_ref(), &thread);
        }
        assert!(!sync.holds_lock(&thread, object.resolve()));
    }
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "possible safepoint inside a no-safepoint region")]
fn allocation_inside_no_safepoint_region() {
    let runtime = MockRuntime::lightweight();
    let thread = runtime.attach();
    let _nsv = NoSafepointVerifier::new(&thread);
    runtime.allocate(&thread, &TEST_OBJECT);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "possible safepoint inside a no-safepoint region")]
fn enter_inside_no_safepoint_region() {
    let runtime = MockRuntime::legacy();
    let thread = runtime.attach();
    let object = runtime.allocate(&thread, &TEST_OBJECT);
    let lock = pin!(BasicLock::new());

    let _nsv = NoSafepointVerifier::new(&thread);
    runtime.synchronizer().enter(&object, lock.as_ref(), &thread);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "without owning it")]
fn lightweight_exit_without_owning() {
    let runtime = MockRuntime::lightweight();
    let thread = runtime.attach();
    let object = runtime.allocate(&thread, &TEST_OBJECT);
    let lock = pin!(BasicLock::new());

    runtime
        .synchronizer()
        .exit(object.resolve(), lock.as_ref(), &thread);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "without owning it")]
fn legacy_exit_without_owning() {
    let runtime = MockRuntime::legacy();
    let thread = runtime.attach();
    let object = runtime.allocate(&thread, &TEST_OBJECT);
    let lock = pin!(BasicLock::new());

    runtime
        .synchronizer()
        .exit(object.resolve(), lock.as_ref(), &thread);
}

#[test]
fn exit_by_non_owner_leaves_lock_alone() {
    for runtime in [MockRuntime::legacy(), MockRuntime::lightweight()] {
        let thread = runtime.attach();
        let object = runtime.allocate(&thread, &TEST_OBJECT);
        let sync = runtime.synchronizer();
        let lock = pin!(BasicLock::new());

        sync.enter(&object, lock.as_ref(), &thread);
        let mark = object.resolve().header().mark();
        if runtime.locking_mode() == LockingMode::Legacy {
            assert!(mark.is_stack_locked());
        } else {
            assert!(mark.is_fast_locked());
        }

        let intruder = {
            let object = object.clone();
            let runtime2 = runtime.clone();
            runtime.spawn(move |thread| {
                let lock = pin!(BasicLock::new());
                runtime2
                    .synchronizer()
                    .exit(object.resolve(), lock.as_ref(), thread);
            })
        };
        // Fatal in debug builds, logged and ignored otherwise.
        let failed = thread.block_in_vm(|| intruder.join().is_err());
        assert_eq!(failed, cfg!(debug_assertions), "{}", runtime.describe());

        assert_eq!(object.resolve().header().mark(), mark);
        assert!(sync.holds_lock(&thread, object.resolve()));
        assert_eq!(sync.lock_owner(object.resolve()), Some(thread.id()));
        assert_eq!(sync.monitor_count(), 0);

        sync.exit(object.resolve(), lock.as_ref(), &thread);
        assert_eq!(sync.lock_owner(object.resolve()), None);
        assert_eq!(thread.held_monitor_count(), 0);
    }
}
