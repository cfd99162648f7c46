//! Locking-mode selection.
//!
//! The mode is decided once, when the runtime is built, and handed to the
//! synchronizer as a plain value. Nothing reads the flags after that.

use std::{fmt, str::FromStr};

use parking_lot::Mutex;

use crate::{define_flag, define_option_handler};

pub struct SyncFlags;

define_option_handler!(SyncFlags => parse_locking_mode, locking_mode, "Locking algorithm: legacy, lightweight or monitor (default: lightweight)");
define_flag!(SyncFlags =>
    bool,
    use_object_monitor_table,
    false,
    "Keep monitors in a side table instead of the object header. Lightweight mode only. (default: false)"
);
define_flag!(SyncFlags =>
    usize,
    monitor_spins,
    64,
    "Spin iterations on a contended monitor before blocking. (default: 64)"
);
define_flag!(SyncFlags =>
    usize,
    fast_lock_spins,
    16,
    "CAS attempts on a fast-lockable header before inflating. (default: 16)"
);

static LOCKING_MODE: Mutex<Option<String>> = Mutex::new(None);

fn parse_locking_mode(option: &str) {
    *LOCKING_MODE.lock() = Some(option.to_owned());
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LockingMode {
    /// Stack-locking with a displaced header, inflating on contention.
    Legacy,
    /// Per-thread lock stack, monitors inline or in the monitor table.
    #[default]
    Lightweight,
    /// Every lock goes through an inflated monitor.
    Monitor,
}

impl FromStr for LockingMode {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy" | "stack" => Ok(Self::Legacy),
            "lightweight" | "lw" => Ok(Self::Lightweight),
            "monitor" | "heavy" => Ok(Self::Monitor),
            _ => Err(OptionsError::UnknownLockingMode(s.to_owned())),
        }
    }
}

impl fmt::Display for LockingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Legacy => "legacy",
            Self::Lightweight => "lightweight",
            Self::Monitor => "monitor",
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SyncOptions {
    pub locking_mode: LockingMode,
    pub use_object_monitor_table: bool,
    pub monitor_spins: usize,
    pub fast_lock_spins: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new(LockingMode::default())
    }
}

impl SyncOptions {
    pub const fn new(locking_mode: LockingMode) -> Self {
        Self {
            locking_mode,
            use_object_monitor_table: false,
            monitor_spins: 64,
            fast_lock_spins: 16,
        }
    }

    pub const fn with_object_monitor_table(mut self, enabled: bool) -> Self {
        self.use_object_monitor_table = enabled;
        self
    }

    pub const fn with_monitor_spins(mut self, spins: usize) -> Self {
        self.monitor_spins = spins;
        self
    }

    pub const fn with_fast_lock_spins(mut self, spins: usize) -> Self {
        self.fast_lock_spins = spins;
        self
    }

    /// Snapshot of the current [`SyncFlags`] values.
    pub fn from_flags() -> Result<Self, OptionsError> {
        let locking_mode = match LOCKING_MODE.lock().as_deref() {
            Some(mode) => mode.parse()?,
            None => LockingMode::default(),
        };

        let options = Self {
            locking_mode,
            use_object_monitor_table: syncflags_use_object_monitor_table(),
            monitor_spins: syncflags_monitor_spins(),
            fast_lock_spins: syncflags_fast_lock_spins(),
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.use_object_monitor_table && self.locking_mode != LockingMode::Lightweight {
            return Err(OptionsError::TableRequiresLightweight(self.locking_mode));
        }

        if self.fast_lock_spins == 0 {
            return Err(OptionsError::ZeroFastLockSpins);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    UnknownLockingMode(String),
    TableRequiresLightweight(LockingMode),
    ZeroFastLockSpins,
    Flags(crate::utils::flags::FlagError),
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownLockingMode(mode) => write!(f, "unknown locking mode: {}", mode),
            Self::TableRequiresLightweight(mode) => write!(
                f,
                "use_object_monitor_table requires lightweight locking, got {}",
                mode
            ),
            Self::ZeroFastLockSpins => write!(f, "fast_lock_spins cannot be zero"),
            Self::Flags(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for OptionsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Flags(err) => Some(err),
            _ => None,
        }
    }
}

impl From<crate::utils::flags::FlagError> for OptionsError {
    fn from(err: crate::utils::flags::FlagError) -> Self {
        Self::Flags(err)
    }
}
