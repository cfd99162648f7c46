//! Flags of a group are parsed once per process, so everything that depends
//! on parsed values lives in this one test.

use objsync::{
    mock::TEST_OBJECT,
    options::{OptionsError, SyncFlags},
    utils::flags::{self, FlagError, FlagsOf},
    LockingMode, RuntimeBuilder, SyncOptions,
};

fn args(list: &[&str]) -> impl Iterator<Item = String> {
    list.iter().map(|arg| arg.to_string()).collect::<Vec<_>>().into_iter()
}

fn vars(list: &[(&str, &str)]) -> impl Iterator<Item = (String, String)> {
    list.iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect::<Vec<_>>()
        .into_iter()
}

#[test]
fn runtime_from_flags() {
    let names = FlagsOf::<SyncFlags>::describe()
        .into_iter()
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    for name in [
        "locking_mode",
        "use_object_monitor_table",
        "monitor_spins",
        "fast_lock_spins",
    ] {
        assert!(names.contains(&name), "{} is not registered", name);
    }

    let builder = RuntimeBuilder::new()
        .from_flags(
            args(&[
                "--objsync:locking_mode=legacy",
                "--objsync:monitor_spins=0x10",
                "--objsync:no-use-object-monitor-table",
                "--unrelated=1",
                "input.txt",
            ]),
            vars(&[("OBJSYNC_FAST_LOCK_SPINS", "4"), ("HOME", "/root")]),
        )
        .unwrap();

    assert!(FlagsOf::<SyncFlags>::is_set("locking_mode"));
    assert!(FlagsOf::<SyncFlags>::is_set("monitor_spins"));
    assert!(FlagsOf::<SyncFlags>::is_set("fast_lock_spins"));
    assert_eq!(
        SyncOptions::from_flags(),
        Ok(SyncOptions::new(LockingMode::Legacy)
            .with_monitor_spins(16)
            .with_fast_lock_spins(4))
    );

    let runtime = builder.build().unwrap();
    assert_eq!(runtime.synchronizer().locking_mode(), LockingMode::Legacy);
    assert_eq!(runtime.synchronizer().options().monitor_spins, 16);

    let thread = runtime.attach_current_thread();
    let object = runtime.allocate(&thread, &TEST_OBJECT);
    runtime.synchronizer().synchronized(&object, &thread, || {
        assert!(object.resolve().header().mark().is_stack_locked());
    });

    // A second parse is refused; the builder keeps the first values.
    assert!(matches!(
        flags::parse_with_prefix::<SyncFlags>(
            "objsync",
            args(&["--objsync:locking_mode=monitor"]),
            vars(&[])
        ),
        Err(FlagError::FlagsAlreadyInitialized(_))
    ));
    let again = RuntimeBuilder::new()
        .from_flags(args(&["--objsync:locking_mode=monitor"]), vars(&[]))
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(again.synchronizer().locking_mode(), LockingMode::Legacy);

    // Options that fail validation are reported, not silently fixed.
    let invalid = RuntimeBuilder::new()
        .options(SyncOptions::new(LockingMode::Monitor).with_object_monitor_table(true))
        .build();
    assert!(matches!(
        invalid,
        Err(OptionsError::TableRequiresLightweight(LockingMode::Monitor))
    ));
}
