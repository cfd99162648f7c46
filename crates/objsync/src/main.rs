use std::{pin::pin, process::ExitCode, sync::Arc, time::Instant};

use objsync::{
    objectmodel::{reference::Handle, Class},
    options::SyncFlags,
    runtime::threads::ThreadContext,
    sync::BasicLock,
    utils::flags::FlagsOf,
    Runtime, RuntimeBuilder,
};

static COUNTER: Class = Class::new("Counter", 1);

const THREADS: usize = 4;
const ITERATIONS: usize = 10_000;

/// Bumps slot 0 of `counter` under its lock. Every other round nests a second
/// enter so recursion is exercised too.
fn work(runtime: &Runtime, thread: &ThreadContext, counter: &Handle) {
    let sync = runtime.synchronizer();
    for i in 0..ITERATIONS {
        if i % 2 == 0 {
            sync.synchronized(counter, thread, || {
                let obj = counter.resolve();
                obj.store_slot(0, obj.load_slot(0) + 1);
            });
            continue;
        }

        let outer = pin!(BasicLock::new());
        let inner = pin!(BasicLock::new());
        sync.enter(counter, outer.as_ref(), thread);
        sync.enter(counter, inner.as_ref(), thread);
        let obj = counter.resolve();
        obj.store_slot(0, obj.load_slot(0) + 1);
        sync.exit(obj, inner.as_ref(), thread);
        sync.exit(obj, outer.as_ref(), thread);

        thread.poll_safepoint();
    }
}

fn main() -> ExitCode {
    env_logger::init();

    if std::env::args().any(|arg| arg == "--help" || arg == "-h") {
        println!("usage: objsync [--objsync:<flag>=<value>]...\n");
        for (name, comment) in FlagsOf::<SyncFlags>::describe() {
            println!("  --objsync:{:<26} {}", name, comment);
        }
        return ExitCode::SUCCESS;
    }

    let runtime = match RuntimeBuilder::new()
        .from_options()
        .and_then(|builder| builder.build())
    {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            eprintln!("objsync: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let main_thread = runtime.attach_current_thread();
    let counter = runtime.allocate(&main_thread, &COUNTER);
    let hash = runtime.synchronizer().identity_hash(&counter, &main_thread);

    let start = Instant::now();
    let workers = (0..THREADS)
        .map(|_| {
            let runtime = runtime.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                let thread = runtime.attach_current_thread();
                work(&runtime, &thread, &counter);
            })
        })
        .collect::<Vec<_>>();

    let mut failed = false;
    main_thread.block_in_vm(|| {
        for worker in workers {
            failed |= worker.join().is_err();
        }
    });
    if failed {
        eprintln!("objsync: a worker thread panicked");
        return ExitCode::FAILURE;
    }
    let elapsed = start.elapsed();

    let sync = runtime.synchronizer();
    let count = counter.resolve().load_slot(0);
    println!("locking mode:      {}", sync.locking_mode());
    println!("monitor table:     {}", sync.options().use_object_monitor_table);
    println!("threads:           {}", THREADS);
    println!("final count:       {} (expected {})", count, THREADS * ITERATIONS);
    println!("monitors inflated: {}", sync.monitor_count());
    println!(
        "identity hash:     {:#x} (stable: {})",
        hash,
        hash == sync.identity_hash(&counter, &main_thread)
    );
    println!("elapsed:           {:?}", elapsed);

    if count == THREADS * ITERATIONS {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
