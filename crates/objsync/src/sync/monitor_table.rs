//! Where inflated monitors live.
//!
//! Monitors are never deflated: once published, a monitor stays allocated
//! until the synchronizer that created it is dropped. That is what lets the
//! lookups below hand out plain references.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::objectmodel::ObjectReference;

use super::object_monitor::ObjectMonitor;

/// Object identity to monitor map for table mode.
#[derive(Default)]
pub struct MonitorTable {
    map: DashMap<usize, Arc<ObjectMonitor>>,
}

impl MonitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object: ObjectReference) -> Option<&ObjectMonitor> {
        let monitor = self
            .map
            .get(&object.address())
            .map(|entry| Arc::as_ptr(entry.value()))?;
        // SAFETY: entries are never removed, the Arc in the map keeps the
        // monitor alive for as long as `self`.
        Some(unsafe { &*monitor })
    }

    /// Returns the monitor for `object`, creating it with `create` first if
    /// there is none. `create` runs at most once per object.
    pub fn get_or_insert(
        &self,
        object: ObjectReference,
        create: impl FnOnce() -> ObjectMonitor,
    ) -> &ObjectMonitor {
        let existing = self
            .map
            .get(&object.address())
            .map(|entry| Arc::as_ptr(entry.value()));
        let monitor = match existing {
            Some(monitor) => monitor,
            None => {
                let entry = self
                    .map
                    .entry(object.address())
                    .or_insert_with(|| Arc::new(create()));
                Arc::as_ptr(entry.value())
            }
        };
        // SAFETY: see `get`.
        unsafe { &*monitor }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Keeps monitors referenced from object headers alive.
#[derive(Default)]
pub struct MonitorList {
    monitors: Mutex<Vec<Arc<ObjectMonitor>>>,
}

impl MonitorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// The returned reference lives as long as the list.
    pub fn add(&self, monitor: Arc<ObjectMonitor>) -> &ObjectMonitor {
        let ptr = Arc::as_ptr(&monitor);
        self.monitors.lock().push(monitor);
        // SAFETY: monitors are only dropped together with the list.
        unsafe { &*ptr }
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRuntime, TEST_OBJECT};

    #[test]
    fn one_monitor_per_object() {
        let runtime = MockRuntime::lightweight();
        let thread = runtime.attach();
        let a = runtime.heap().allocate(&thread, &TEST_OBJECT).resolve();
        let b = runtime.heap().allocate(&thread, &TEST_OBJECT).resolve();

        let table = MonitorTable::new();
        assert!(table.get(a).is_none());

        let first = table.get_or_insert(a, || ObjectMonitor::new(a, 0)) as *const ObjectMonitor;
        let again = table.get_or_insert(a, || unreachable!()) as *const ObjectMonitor;
        assert_eq!(first, again);
        assert_eq!(table.get(a).map(|m| m as *const ObjectMonitor), Some(first));

        let other = table.get_or_insert(b, || ObjectMonitor::new(b, 0));
        assert_eq!(other.object(), b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn list_keeps_monitors() {
        let runtime = MockRuntime::lightweight();
        let thread = runtime.attach();
        let a = runtime.heap().allocate(&thread, &TEST_OBJECT).resolve();

        let list = MonitorList::new();
        let monitor = list.add(Arc::new(ObjectMonitor::new(a, 0)));
        assert_eq!(monitor.object(), a);
        assert_eq!(list.len(), 1);
    }
}
