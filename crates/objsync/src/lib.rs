//! Per-object monitors for a managed runtime.
//!
//! Every heap object can be locked recursively by one thread at a time.
//! [`ObjectSynchronizer`] implements the monitor enter and exit operations on
//! top of one of two locking algorithms, picked once from [`SyncOptions`]
//! when the [`Runtime`] is built.
//!
//! ```no_run
//! use objsync::{objectmodel::Class, options::SyncOptions, sync::BasicLock, Runtime};
//!
//! static COUNTER: Class = Class::new("Counter", 1);
//!
//! let runtime = Runtime::builder().options(SyncOptions::default()).build().unwrap();
//! let thread = runtime.attach_current_thread();
//! let counter = runtime.allocate(&thread, &COUNTER);
//!
//! let lock = std::pin::pin!(BasicLock::new());
//! runtime.synchronizer().enter(&counter, lock.as_ref(), &thread);
//! counter.resolve().store_slot(0, 1);
//! runtime.synchronizer().exit(counter.resolve(), lock.as_ref(), &thread);
//! ```

pub mod mock;
pub mod objectmodel;
pub mod options;
pub mod runtime;
pub mod sync;
pub mod utils;

pub use options::{LockingMode, SyncOptions};
pub use runtime::{Runtime, RuntimeBuilder};
pub use sync::ObjectSynchronizer;
