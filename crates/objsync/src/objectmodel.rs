//! # Object model
//!
//! Just enough of a managed heap for the synchronizer: classes that may be
//! value-based, objects with a header carrying the lock-state word and a few
//! word-sized slots, and handles to hold on to them.
//!
//! Objects never move and are freed together with the [`Heap`], so an
//! [`ObjectReference`] handed out by a heap stays valid for the heap's
//! lifetime.

use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use header::HeapObjectHeader;
use parking_lot::Mutex;
use reference::Handle;

use crate::runtime::threads::ThreadContext;

pub mod header;
pub mod reference;

pub struct Class {
    name: &'static str,
    value_based: bool,
    slots: usize,
}

impl Class {
    pub const fn new(name: &'static str, slots: usize) -> Self {
        Self {
            name,
            value_based: false,
            slots,
        }
    }

    /// Instances have no stable identity and must never be synchronized on.
    pub const fn value_based(name: &'static str, slots: usize) -> Self {
        Self {
            name,
            value_based: true,
            slots,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn is_value_based(&self) -> bool {
        self.value_based
    }

    pub const fn slots(&self) -> usize {
        self.slots
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("value_based", &self.value_based)
            .finish()
    }
}

pub struct HeapObject {
    header: HeapObjectHeader,
    slots: Box<[AtomicUsize]>,
}

impl HeapObject {
    fn new(class: &'static Class) -> Self {
        Self {
            header: HeapObjectHeader::new(class),
            slots: (0..class.slots()).map(|_| AtomicUsize::new(0)).collect(),
        }
    }
}

/// Raw reference to a heap object. Identity is the object's address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectReference(NonNull<HeapObject>);

// Everything reachable through a reference is atomic.
unsafe impl Send for ObjectReference {}
unsafe impl Sync for ObjectReference {}

impl ObjectReference {
    pub fn from_raw(ptr: *mut HeapObject) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn to_raw(self) -> *mut HeapObject {
        self.0.as_ptr()
    }

    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    fn object<'a>(self) -> &'a HeapObject {
        // SAFETY: objects are only freed when their heap is dropped, and
        // references are not used past that point.
        unsafe { self.0.as_ref() }
    }

    pub fn header<'a>(self) -> &'a HeapObjectHeader {
        &self.object().header
    }

    pub fn class(self) -> &'static Class {
        self.header().class()
    }

    pub fn slot<'a>(self, index: usize) -> &'a AtomicUsize {
        &self.object().slots[index]
    }

    pub fn load_slot(self, index: usize) -> usize {
        self.slot(index).load(Ordering::Relaxed)
    }

    pub fn store_slot(self, index: usize, value: usize) {
        self.slot(index).store(value, Ordering::Relaxed)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.class().name(), self.address())
    }
}

impl fmt::Pointer for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

/// Owns every object it allocates.
#[derive(Default)]
pub struct Heap {
    objects: Mutex<Vec<Box<HeapObject>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocation is a possible safepoint, so it is not allowed in
    /// no-safepoint regions.
    pub fn allocate(&self, thread: &ThreadContext, class: &'static Class) -> Handle {
        thread.check_possible_safepoint();
        thread.poll_safepoint();

        let mut object = Box::new(HeapObject::new(class));
        let reference = ObjectReference(NonNull::from(&mut *object));
        self.objects.lock().push(object);
        Handle::new(reference)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}
