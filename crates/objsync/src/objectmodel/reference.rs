//! # Object handles
//!
//! A [`Handle`] is an indirect, shareable slot holding an object reference.
//! Code that may reach a safepoint keeps handles and only resolves them to
//! raw [`ObjectReference`]s inside safepoint-free stretches.

use std::{
    fmt,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

use super::{HeapObject, ObjectReference};

#[derive(Clone)]
pub struct Handle {
    slot: Arc<AtomicPtr<HeapObject>>,
}

impl Handle {
    pub fn new(object: ObjectReference) -> Self {
        Self {
            slot: Arc::new(AtomicPtr::new(object.to_raw())),
        }
    }

    pub fn resolve(&self) -> ObjectReference {
        let ptr = self.slot.load(Ordering::Acquire);
        match ObjectReference::from_raw(ptr) {
            Some(object) => object,
            None => unreachable!("handles never hold null"),
        }
    }
}

impl From<ObjectReference> for Handle {
    fn from(object: ObjectReference) -> Self {
        Self::new(object)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.resolve()).finish()
    }
}
