//! A small library to parse command-line and environmental flags.
//!
//! Flags are grouped by a marker type (`FlagsOf<T>`) and registered before
//! `main` runs by the [`define_flag!`](crate::define_flag) family of macros.
//! Values live in atomics so they can be read from any thread without
//! synchronization once parsing is done.

use std::{
    any::TypeId,
    borrow::Cow,
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

pub type OptionHandler = fn(&str);

#[derive(Clone, Copy)]
enum FlagValue {
    Boolean(&'static AtomicBool),
    Usize(&'static AtomicUsize),
    OptionHandler(OptionHandler),
}

struct Flag {
    comment: &'static str,
    name: &'static str,
    short: Option<&'static str>,
    value: FlagValue,
    is_set: bool,
}

#[derive(Default)]
pub struct Flags {
    flags: Vec<Flag>,
    initialized: bool,
}

/// Registry of flag groups, keyed by the marker type of each group.
static FLAGS_MAP: Mutex<Vec<(TypeId, Flags)>> = Mutex::new(Vec::new());

fn with_flags<T: 'static, R>(f: impl FnOnce(&mut Flags) -> R) -> R {
    let key = TypeId::of::<T>();
    let mut map = FLAGS_MAP.lock();
    let ix = match map.iter().position(|(id, _)| *id == key) {
        Some(ix) => ix,
        None => {
            map.push((key, Flags::default()));
            map.len() - 1
        }
    };
    f(&mut map[ix].1)
}

fn try_with_flags<T: 'static, R>(f: impl FnOnce(&mut Flags) -> R) -> Option<R> {
    let key = TypeId::of::<T>();
    let mut map = FLAGS_MAP.lock();
    map.iter_mut()
        .find(|(id, _)| *id == key)
        .map(|(_, flags)| f(flags))
}

pub struct FlagsOf<T>(PhantomData<T>);

impl<T: 'static> FlagsOf<T> {
    fn lookup(name: &str, short: bool) -> Option<FlagValue> {
        with_flags::<T, _>(|flags| {
            flags
                .flags
                .iter()
                .find(|flag| {
                    if short {
                        flag.short == Some(name)
                    } else {
                        flag.name == name
                    }
                })
                .map(|flag| flag.value)
        })
    }

    fn mark_set(name: &str, short: bool) {
        with_flags::<T, _>(|flags| {
            if let Some(flag) = flags.flags.iter_mut().find(|flag| {
                if short {
                    flag.short == Some(name)
                } else {
                    flag.name == name
                }
            }) {
                flag.is_set = true;
            }
        })
    }

    pub fn is_set(name: &str) -> bool {
        with_flags::<T, _>(|flags| {
            flags
                .flags
                .iter()
                .any(|flag| flag.name == name && flag.is_set)
        })
    }

    /// Name and description of every flag in this group, in registration order.
    pub fn describe() -> Vec<(&'static str, &'static str)> {
        with_flags::<T, _>(|flags| {
            flags
                .flags
                .iter()
                .map(|flag| (flag.name, flag.comment))
                .collect()
        })
    }

    fn add_flag(flag: Flag) {
        with_flags::<T, _>(|flags| {
            if !flags.flags.iter().any(|f| f.name == flag.name) {
                flags.flags.push(flag);
            }
        })
    }

    fn set_flag_from_string(value: FlagValue, argument: &str) -> bool {
        match value {
            FlagValue::Boolean(cell) => match argument {
                "true" => cell.store(true, Ordering::Relaxed),
                "false" => cell.store(false, Ordering::Relaxed),
                _ => return false,
            },

            FlagValue::Usize(cell) => {
                let (digits, radix) = if argument.len() > 2 && argument.starts_with("0x") {
                    (&argument[2..], 16)
                } else if argument.len() > 1 && argument.starts_with('0') {
                    (&argument[1..], 8)
                } else {
                    (argument, 10)
                };

                match usize::from_str_radix(digits, radix) {
                    Ok(value) => cell.store(value, Ordering::Relaxed),
                    Err(_) => return false,
                }
            }

            FlagValue::OptionHandler(handler) => handler(argument),
        }

        true
    }

    fn parse<const SHORT: bool>(option: &str) -> Result<(), FlagError> {
        let equals_pos = option.find('=');

        let argument = if let Some(equals_pos) = equals_pos {
            &option[equals_pos + 1..]
        } else if option.starts_with("no_") || option.starts_with("no-") {
            "false"
        } else {
            "true"
        };

        let name = match equals_pos {
            Some(equals_pos) => &option[..equals_pos],
            None if argument == "false" => &option[3..],
            None => option,
        };
        let name = name.replace('-', "_");

        let Some(value) = Self::lookup(&name, SHORT) else {
            return Err(FlagError::FlagNotFound(name));
        };

        if Self::set_flag_from_string(value, argument) {
            Self::mark_set(&name, SHORT);
        } else {
            log::warn!(
                target: "objsync::flags",
                "Ignoring flag: {} is an invalid value for flag {}",
                argument,
                name
            );
        }

        Ok(())
    }

    fn parse_env(option: &str, argument: &str) -> Result<(), FlagError> {
        let name = option.to_lowercase();
        let Some(value) = Self::lookup(&name, false) else {
            return Err(FlagError::FlagNotFound(option.to_owned()));
        };

        if Self::set_flag_from_string(value, argument) {
            Self::mark_set(&name, false);
        } else {
            log::warn!(
                target: "objsync::flags",
                "Ignoring flag: {} is an invalid value for flag {}",
                argument,
                name
            );
        }
        Ok(())
    }

    fn process_command_line_flags(
        prefix: Option<&str>,
        flags: impl Iterator<Item = String>,
    ) -> Result<(), FlagError> {
        let mut flags = flags.collect::<Vec<String>>();
        flags.sort();

        let long_prefix = prefix
            .map(|prefix| Cow::Owned(format!("--{}:", prefix)))
            .unwrap_or(Cow::Borrowed("--"));
        let short_prefix = prefix
            .map(|prefix| Cow::Owned(format!("-{}:", prefix)))
            .unwrap_or(Cow::Borrowed("-"));

        for flag in &flags {
            if is_valid_flag(flag, &long_prefix) {
                Self::parse::<false>(&flag[long_prefix.len()..])?;
            } else if is_valid_flag(flag, &short_prefix) {
                Self::parse::<true>(&flag[short_prefix.len()..])?;
            }
        }

        with_flags::<T, _>(|flags| flags.initialized = true);
        Ok(())
    }

    fn process_environmental_vars(
        prefix: Option<&str>,
        vars: impl Iterator<Item = (String, String)>,
    ) {
        let env_prefix = prefix
            .map(|prefix| format!("{}_", prefix.to_uppercase()))
            .unwrap_or_default();

        for (option, argument) in vars {
            // Unrelated environment variables are expected here.
            let Some(option) = option.strip_prefix(&env_prefix) else {
                continue;
            };
            let _ = Self::parse_env(option, &argument);
        }
    }
}

fn is_valid_flag(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len() && name.starts_with(prefix)
}

fn check_not_initialized<T: 'static>() -> Result<(), FlagError> {
    match try_with_flags::<T, _>(|flags| flags.initialized) {
        None => Err(FlagError::NoFlags(std::any::type_name::<T>())),
        Some(true) => Err(FlagError::FlagsAlreadyInitialized(
            std::any::type_name::<T>(),
        )),
        Some(false) => Ok(()),
    }
}

/// Parses flags of group `T` from the environment first and from `args` second,
/// so the command line wins. A group can be parsed once.
pub fn parse<T: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    check_not_initialized::<T>()?;
    FlagsOf::<T>::process_environmental_vars(None, env);
    FlagsOf::<T>::process_command_line_flags(None, args)
}

/// Same as [`parse`] but flags are spelled `--prefix:name` on the command line
/// and `PREFIX_NAME` in the environment.
pub fn parse_with_prefix<T: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    check_not_initialized::<T>()?;
    FlagsOf::<T>::process_environmental_vars(Some(prefix), env);
    FlagsOf::<T>::process_command_line_flags(Some(prefix), args)
}

#[doc(hidden)]
pub fn register_bool<T: 'static>(
    value: &'static AtomicBool,
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
) {
    FlagsOf::<T>::add_flag(Flag {
        comment,
        name,
        short,
        value: FlagValue::Boolean(value),
        is_set: false,
    });
}

#[doc(hidden)]
pub fn register_usize<T: 'static>(
    value: &'static AtomicUsize,
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
) {
    FlagsOf::<T>::add_flag(Flag {
        comment,
        name,
        short,
        value: FlagValue::Usize(value),
        is_set: false,
    });
}

/// Registers an option handler.
#[doc(hidden)]
pub fn register_handler<T: 'static>(
    handler: OptionHandler,
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
) {
    FlagsOf::<T>::add_flag(Flag {
        comment,
        name,
        short,
        value: FlagValue::OptionHandler(handler),
        is_set: false,
    });
}

/// Defines a `bool` or `usize` flag in group `$of`.
///
/// Generates `<of>_<name>()`, `set_<of>_<name>()` and `is_<of>_<name>_set()`.
#[macro_export]
macro_rules! define_flag {
    ($of: ident => $typ: ident, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@impl $of, $typ, $name, None, $default_value, $comment);
    };

    ($of: ident => $typ: ident, $name: ident, $short: literal, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@impl $of, $typ, $name, Some($short), $default_value, $comment);
    };

    (@impl $of: ident, $typ: ident, $name: ident, $short: expr, $default_value: expr, $comment: literal) => {
        paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: std::sync::atomic::[<Atomic $typ:camel>] =
                std::sync::atomic::[<Atomic $typ:camel>]::new($default_value);

            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::[<register_ $typ:lower>]::<$of>(
                    &[<$of:upper _FLAG_ $name:upper>],
                    stringify!($name),
                    $comment,
                    $short,
                );
            }

            #[doc = $comment]
            pub fn [<$of:lower _ $name>]() -> $typ {
                [<$of:upper _FLAG_ $name:upper>].load(std::sync::atomic::Ordering::Relaxed)
            }

            pub fn [<set_ $of:lower _ $name>]($name: $typ) {
                [<$of:upper _FLAG_ $name:upper>].store($name, std::sync::atomic::Ordering::Relaxed);
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[macro_export]
macro_rules! define_option_handler {
    ($of: ident => $handler: expr, $name: ident, $comment: literal) => {
        paste::paste! {
            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register_handler::<$of>($handler, stringify!($name), $comment, None);
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagError {
    FlagNotFound(String),
    FlagsAlreadyInitialized(&'static str),
    NoFlags(&'static str),
}

impl fmt::Display for FlagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlagNotFound(name) => write!(f, "unknown flag: {}", name),
            Self::FlagsAlreadyInitialized(group) => {
                write!(f, "flags of {} were already parsed", group)
            }
            Self::NoFlags(group) => write!(f, "no flags registered for {}", group),
        }
    }
}

impl std::error::Error for FlagError {}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestFlags;
    struct EmptyFlags;

    crate::define_flag!(TestFlags => bool, verbose, false, "Print more");
    crate::define_flag!(TestFlags => usize, spins, 4, "How many spins");
    crate::define_flag!(TestFlags => usize, depth, "d", 1, "Depth");
    crate::define_flag!(TestFlags => bool, checked, true, "Checked mode");

    static PICKED: Mutex<String> = Mutex::new(String::new());

    fn pick(option: &str) {
        *PICKED.lock() = option.to_owned();
    }

    crate::define_option_handler!(TestFlags => pick, color, "Pick a color");

    #[test]
    fn parses_command_line_and_env() {
        let args = [
            "--verbose",
            "--spins=0x10",
            "-d=7",
            "--no-checked",
            "--color=blue",
            "positional",
        ]
        .into_iter()
        .map(String::from);
        let env = [("SPINS".to_owned(), "3".to_owned())].into_iter();

        parse::<TestFlags>(args, env).unwrap();

        assert!(testflags_verbose());
        assert!(is_testflags_verbose_set());
        // command line overrides the environment
        assert_eq!(testflags_spins(), 16);
        assert_eq!(testflags_depth(), 7);
        assert!(!testflags_checked());
        assert_eq!(&*PICKED.lock(), "blue");
        assert!(is_testflags_color_set());

        let again = parse::<TestFlags>(std::iter::empty(), std::iter::empty());
        assert!(matches!(again, Err(FlagError::FlagsAlreadyInitialized(_))));

        let names = FlagsOf::<TestFlags>::describe()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        assert!(names.contains(&"spins"));
        assert!(names.contains(&"color"));
    }

    #[test]
    fn unknown_group_is_reported() {
        let result = parse::<EmptyFlags>(std::iter::empty(), std::iter::empty());
        assert!(matches!(result, Err(FlagError::NoFlags(_))));
    }
}
