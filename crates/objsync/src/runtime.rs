use std::sync::Arc;

use threads::{ThreadContext, Threads};

use crate::{
    objectmodel::{reference::Handle, Class, Heap},
    options::{OptionsError, SyncFlags, SyncOptions},
    sync::ObjectSynchronizer,
    utils::flags::{self, FlagError},
};

pub mod safepoint;
pub mod threads;

/// A heap, the threads working on it and the synchronizer for its objects.
pub struct Runtime {
    threads: Arc<Threads>,
    synchronizer: ObjectSynchronizer,
    heap: Heap,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn threads(&self) -> &Arc<Threads> {
        &self.threads
    }

    pub fn synchronizer(&self) -> &ObjectSynchronizer {
        &self.synchronizer
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Registers the calling OS thread. Panics if it is already attached.
    pub fn attach_current_thread(&self) -> ThreadContext {
        ThreadContext::attach(self.threads.clone())
    }

    pub fn allocate(&self, thread: &ThreadContext, class: &'static Class) -> Handle {
        self.heap.allocate(thread, class)
    }
}

pub struct RuntimeBuilder {
    options: SyncOptions,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            options: SyncOptions::default(),
        }
    }

    pub fn options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Reads [`SyncFlags`] from `args` (`--objsync:locking_mode=legacy`) and
    /// `env` (`OBJSYNC_LOCKING_MODE=legacy`). Flags parsed earlier in the
    /// process are reused.
    pub fn from_flags(
        self,
        args: impl Iterator<Item = String>,
        env: impl Iterator<Item = (String, String)>,
    ) -> Result<Self, OptionsError> {
        match flags::parse_with_prefix::<SyncFlags>("objsync", args, env) {
            Ok(()) | Err(FlagError::FlagsAlreadyInitialized(_)) => {}
            Err(err) => return Err(err.into()),
        }

        Ok(self.options(SyncOptions::from_flags()?))
    }

    /// [`from_flags`](Self::from_flags) with the process arguments and
    /// environment.
    pub fn from_options(self) -> Result<Self, OptionsError> {
        self.from_flags(std::env::args().skip(1), std::env::vars())
    }

    pub fn build(self) -> Result<Runtime, OptionsError> {
        self.options.validate()?;

        let threads = Arc::new(Threads::new());
        Ok(Runtime {
            synchronizer: ObjectSynchronizer::new(self.options, threads.clone()),
            threads,
            heap: Heap::new(),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
