use std::{
    marker::{PhantomData, PhantomPinned},
    pin::Pin,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

use crate::{objectmodel::header::LockStateWord, runtime::threads::ThreadId};

use super::object_monitor::ObjectMonitor;

/// Lock record used for one enter/exit pair.
///
/// Lives on the locking thread's stack and is used pinned, so that legacy
/// stack-locking can publish its address in the object header. Not `Send`,
/// `Sync` or `Clone`: a record belongs to the frame that created it.
///
/// ```ignore
/// let lock = std::pin::pin!(BasicLock::new());
/// synchronizer.enter(&handle, lock.as_ref(), &thread);
/// synchronizer.exit(handle.resolve(), lock.as_ref(), &thread);
/// ```
pub struct BasicLock {
    displaced_header: AtomicUsize,
    owner: AtomicU64,
    object_monitor_cache: AtomicPtr<ObjectMonitor>,
    _pinned: PhantomPinned,
    _not_send: PhantomData<*const ()>,
}

impl BasicLock {
    pub const fn new() -> Self {
        Self {
            displaced_header: AtomicUsize::new(LockStateWord::UNUSED_MARK.value()),
            owner: AtomicU64::new(0),
            object_monitor_cache: AtomicPtr::new(null_mut()),
            _pinned: PhantomPinned,
            _not_send: PhantomData,
        }
    }

    pub fn address(self: Pin<&Self>) -> usize {
        self.get_ref() as *const Self as usize
    }

    /// Header the object had before it was stack-locked with this record.
    /// Zero marks a recursive stack-lock, [`LockStateWord::UNUSED_MARK`] a
    /// record whose lock went through a monitor.
    pub fn displaced_header(&self) -> LockStateWord {
        LockStateWord::from_raw(self.displaced_header.load(Ordering::Acquire))
    }

    pub(crate) fn set_displaced_header(&self, mark: LockStateWord) {
        self.displaced_header.store(mark.value(), Ordering::Release);
    }

    pub(crate) fn set_recursive(&self) {
        self.displaced_header.store(0, Ordering::Release);
    }

    pub fn is_recursive(&self) -> bool {
        self.displaced_header.load(Ordering::Acquire) == 0
    }

    /// Thread that stack-locked an object with this record.
    pub fn owner(&self) -> ThreadId {
        ThreadId::from_raw(self.owner.load(Ordering::Acquire))
    }

    pub(crate) fn set_owner(&self, thread: ThreadId) {
        self.owner.store(thread.as_u64(), Ordering::Release);
    }

    pub fn object_monitor_cache(&self) -> Option<&ObjectMonitor> {
        let monitor = self.object_monitor_cache.load(Ordering::Relaxed);
        // SAFETY: only monitors owned by a live synchronizer are cached, and
        // the cache is cleared on every enter.
        unsafe { monitor.as_ref() }
    }

    pub(crate) fn set_object_monitor_cache(&self, monitor: &ObjectMonitor) {
        self.object_monitor_cache
            .store(monitor as *const ObjectMonitor as *mut _, Ordering::Relaxed);
    }

    pub(crate) fn clear_object_monitor_cache(&self) {
        self.object_monitor_cache.store(null_mut(), Ordering::Relaxed);
    }

    /// Reads a record through the address published in a stack-locked
    /// header.
    ///
    /// # Safety
    ///
    /// The record must be kept alive for `'a`. For stack-locks that is the
    /// case while the header holds [`LockStateWord::INFLATING`] installed by
    /// the caller, since the owner cannot finish its exit until the header
    /// changes again.
    pub(crate) unsafe fn from_address<'a>(address: usize) -> &'a BasicLock {
        &*(address as *const BasicLock)
    }
}

impl Default for BasicLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record() {
        let lock = std::pin::pin!(BasicLock::new());
        assert_eq!(lock.displaced_header(), LockStateWord::UNUSED_MARK);
        assert!(lock.object_monitor_cache().is_none());
        assert_eq!(lock.as_ref().address() % 8, 0);
    }
}
