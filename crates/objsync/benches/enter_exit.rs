use std::{hint::black_box, pin::pin};

use criterion::{criterion_group, criterion_main, Criterion};
use objsync::{
    mock::{MockRuntime, TEST_OBJECT},
    sync::BasicLock,
};

pub fn criterion_benchmark(c: &mut Criterion) {
    for runtime in MockRuntime::all() {
        let thread = runtime.attach();
        let object = runtime.allocate(&thread, &TEST_OBJECT);
        let sync = runtime.synchronizer();

        c.bench_function(&format!("enter/exit {}", runtime.describe()), |b| {
            b.iter(|| {
                let lock = pin!(BasicLock::new());
                sync.enter(black_box(&object), lock.as_ref(), &thread);
                sync.exit(object.resolve(), lock.as_ref(), &thread);
            });
        });

        c.bench_function(&format!("quick_enter {}", runtime.describe()), |b| {
            b.iter(|| {
                let lock = pin!(BasicLock::new());
                let obj = black_box(object.resolve());
                if !sync.quick_enter(Some(obj), &thread, lock.as_ref()) {
                    sync.enter(&object, lock.as_ref(), &thread);
                }
                sync.exit(obj, lock.as_ref(), &thread);
            });
        });

        c.bench_function(&format!("recursive enter {}", runtime.describe()), |b| {
            let outer = pin!(BasicLock::new());
            sync.enter(&object, outer.as_ref(), &thread);
            b.iter(|| {
                let inner = pin!(BasicLock::new());
                sync.enter(black_box(&object), inner.as_ref(), &thread);
                sync.exit(object.resolve(), inner.as_ref(), &thread);
            });
            sync.exit(object.resolve(), outer.as_ref(), &thread);
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
