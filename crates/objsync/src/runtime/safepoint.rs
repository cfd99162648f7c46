//! Safepoints and the no-safepoint verifier.
//!
//! A safepoint is requested by raising a global flag and waiting until every
//! attached thread is in a safe [`ThreadState`]. Threads running managed or
//! runtime code notice the flag when they poll or when they leave a safe
//! state, and park at the [`Barrier`] until the requester drops its
//! [`SafepointScope`].

use std::{marker::PhantomData, time::Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::utils::Backoff;

use super::threads::{ThreadContext, ThreadId, ThreadState, Threads};

pub struct Barrier {
    armed: Mutex<bool>,
    cv_wakeup: Condvar,
}

impl Barrier {
    pub const fn new() -> Barrier {
        Barrier {
            armed: Mutex::new(false),
            cv_wakeup: Condvar::new(),
        }
    }

    pub fn is_armed(&self) -> bool {
        *self.armed.lock()
    }

    pub fn arm(&self) {
        let mut armed = self.armed.lock();
        assert!(!*armed);
        *armed = true;
    }

    pub fn disarm(&self) {
        let mut armed = self.armed.lock();
        assert!(*armed);
        *armed = false;
        self.cv_wakeup.notify_all();
    }

    pub fn wait_in_safepoint(&self) {
        let mut armed = self.armed.lock();
        while *armed {
            self.cv_wakeup.wait(&mut armed);
        }
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Every attached thread other than the requester is in a safe state while
/// this is alive.
pub struct SafepointScope<'a> {
    threads: &'a Threads,
    _serialize: MutexGuard<'a, ()>,
}

impl<'a> SafepointScope<'a> {
    pub(crate) fn begin(
        threads: &'a Threads,
        serialize: MutexGuard<'a, ()>,
        requester: Option<ThreadId>,
    ) -> Self {
        let start = Instant::now();
        threads.barrier.arm();
        threads.set_safepoint_requested(true);

        let mut backoff = Backoff::new();
        loop {
            let pending = threads
                .snapshot()
                .iter()
                .filter(|thread| Some(thread.id()) != requester)
                .filter(|thread| !thread.state().is_safe())
                .count();
            if pending == 0 {
                break;
            }
            backoff.snooze();
        }

        log::debug!(
            target: "objsync::safepoint",
            "safepoint reached in {:?}",
            start.elapsed()
        );

        Self {
            threads,
            _serialize: serialize,
        }
    }

    /// States of all attached threads as seen from inside the safepoint.
    pub fn thread_states(&self) -> Vec<(ThreadId, ThreadState)> {
        self.threads
            .snapshot()
            .iter()
            .map(|thread| (thread.id(), thread.state()))
            .collect()
    }
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        self.threads.set_safepoint_requested(false);
        self.threads.barrier.disarm();
        log::debug!(target: "objsync::safepoint", "safepoint released");
    }
}

/// Marks a region in which the current thread must not reach a safepoint:
/// no polls, no blocking and no allocation.
///
/// Violations panic in debug builds. In release builds the guard does
/// nothing.
pub struct NoSafepointVerifier<'a> {
    #[cfg(debug_assertions)]
    thread: &'a ThreadContext,
    _marker: PhantomData<&'a ThreadContext>,
}

impl<'a> NoSafepointVerifier<'a> {
    #[cfg(debug_assertions)]
    pub fn new(thread: &'a ThreadContext) -> Self {
        let depth = thread.no_safepoint_depth();
        depth.set(depth.get() + 1);
        Self {
            thread,
            _marker: PhantomData,
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub fn new(_thread: &'a ThreadContext) -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl Drop for NoSafepointVerifier<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let depth = self.thread.no_safepoint_depth();
            depth.set(depth.get() - 1);
        }
    }
}
