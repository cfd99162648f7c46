//! Simple mock runtimes used in tests

use std::{ops::Deref, sync::Arc, thread::JoinHandle};

use crate::{
    objectmodel::Class,
    options::{LockingMode, SyncOptions},
    runtime::{threads::ThreadContext, Runtime},
};

pub static TEST_OBJECT: Class = Class::new("TestObject", 2);
pub static VALUE_OBJECT: Class = Class::value_based("ValueObject", 1);

/// Routes `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone)]
pub struct MockRuntime(Arc<Runtime>);

impl MockRuntime {
    pub fn new(options: SyncOptions) -> Self {
        init_logging();
        match Runtime::builder().options(options).build() {
            Ok(runtime) => Self(Arc::new(runtime)),
            Err(err) => panic!("invalid mock options {:?}: {}", options, err),
        }
    }

    pub fn legacy() -> Self {
        Self::new(SyncOptions::new(LockingMode::Legacy))
    }

    pub fn monitor() -> Self {
        Self::new(SyncOptions::new(LockingMode::Monitor))
    }

    pub fn lightweight() -> Self {
        Self::new(SyncOptions::new(LockingMode::Lightweight))
    }

    pub fn table() -> Self {
        Self::new(SyncOptions::new(LockingMode::Lightweight).with_object_monitor_table(true))
    }

    /// One runtime per locking configuration.
    pub fn all() -> Vec<Self> {
        vec![
            Self::legacy(),
            Self::monitor(),
            Self::lightweight(),
            Self::table(),
        ]
    }

    pub fn attach(&self) -> ThreadContext {
        self.0.attach_current_thread()
    }

    pub fn locking_mode(&self) -> LockingMode {
        self.0.synchronizer().locking_mode()
    }

    pub fn describe(&self) -> String {
        let options = self.0.synchronizer().options();
        if options.use_object_monitor_table {
            format!("{} (table)", options.locking_mode)
        } else {
            options.locking_mode.to_string()
        }
    }

    /// Spawns an OS thread attached to this runtime for the duration of `f`.
    pub fn spawn<T, F>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(&ThreadContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let runtime = self.clone();
        std::thread::spawn(move || {
            let thread = runtime.attach();
            f(&thread)
        })
    }
}

impl Deref for MockRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.0
    }
}
