pub mod flags;

/// Bounded exponential backoff used by spin loops in the lock paths.
///
/// Spins with [`std::hint::spin_loop`] first and falls back to yielding the
/// time slice once the step count passes `SPIN_LIMIT`.
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub const fn new() -> Self {
        Self { step: 0 }
    }

    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1 << self.step {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }

    /// Spin-only variant, never yields.
    pub fn spin(&mut self) {
        for _ in 0..1 << self.step.min(Self::SPIN_LIMIT) {
            std::hint::spin_loop();
        }
        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
