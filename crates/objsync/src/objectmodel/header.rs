//! Object header and the lock-state word it carries.
//!
//! ```text
//!  63 ............. 39 38 ........ 8 7 ..... 2 1 0
//! [      unused      |   hash (31)  | unused  |lock]   unlocked / fast-locked / table monitor
//! [          address of the owner's BasicLock     |00]  legacy stack-locked
//! [          address of the ObjectMonitor          |10]  inline monitor
//! [                       0                        ]  legacy INFLATING
//! ```
//!
//! Which of these shapes a word can take depends on the locking mode picked
//! at startup. The shapes of different modes are never mixed.

use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use easy_bitfield::{BitField, BitFieldTrait, FromBitfield, ToBitfield};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::sync::object_monitor::ObjectMonitor;

use super::Class;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum LockBits {
    /// Stack-locked (legacy) or fast-locked (lightweight).
    Locked = 0b00,
    Unlocked = 0b01,
    Monitor = 0b10,
    Marked = 0b11,
}

impl<S: FromPrimitive> ToBitfield<S> for LockBits {
    fn one() -> Self {
        unreachable!()
    }

    fn zero() -> Self {
        unreachable!()
    }

    fn to_bitfield(self) -> S {
        S::from_u8(self as u8).unwrap()
    }
}

impl<S: ToPrimitive> FromBitfield<S> for LockBits {
    fn from_bitfield(value: S) -> Self {
        match value.to_u8().unwrap() {
            0b00 => Self::Locked,
            0b01 => Self::Unlocked,
            0b10 => Self::Monitor,
            _ => Self::Marked,
        }
    }

    fn from_i64(_value: i64) -> Self {
        unreachable!()
    }
}

/// Identity hash as stored in the header. Zero means "no hash yet".
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct IdentityHash(pub u32);

impl<S: FromPrimitive> ToBitfield<S> for IdentityHash {
    fn one() -> Self {
        Self(1)
    }

    fn zero() -> Self {
        Self(0)
    }

    fn to_bitfield(self) -> S {
        S::from_u32(self.0).unwrap()
    }
}

impl<S: ToPrimitive> FromBitfield<S> for IdentityHash {
    fn from_bitfield(value: S) -> Self {
        Self(value.to_u32().unwrap())
    }

    fn from_i64(value: i64) -> Self {
        Self(value as u32)
    }
}

pub const HASH_SHIFT: usize = 8;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const HASH_BITS: usize = 31;
    } else {
        pub const HASH_BITS: usize = 25;
    }
}

pub const HASH_MASK: u32 = ((1u64 << HASH_BITS) - 1) as u32;

pub type LockBitsField = BitField<usize, LockBits, 0, 2, false>;
pub type HashField = BitField<usize, IdentityHash, HASH_SHIFT, HASH_BITS, false>;

const LOCK_MASK: usize = 0b11;

/// The lock-state word ("mark word") of an object header.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct LockStateWord(usize);

impl LockStateWord {
    /// Legacy mode only: a monitor is being installed, readers must wait.
    pub const INFLATING: Self = Self(0);
    /// Displaced-header marker for lock records whose object is locked
    /// through a monitor. Never appears in a header.
    pub const UNUSED_MARK: Self = Self(LockBits::Marked as usize);

    pub(crate) const fn from_raw(value: usize) -> Self {
        Self(value)
    }

    pub fn unlocked() -> Self {
        Self(LockBitsField::encode(LockBits::Unlocked))
    }

    pub const fn value(self) -> usize {
        self.0
    }

    pub fn lock_bits(self) -> LockBits {
        LockBitsField::decode(self.0)
    }

    pub fn is_unlocked(self) -> bool {
        self.lock_bits() == LockBits::Unlocked
    }

    /// Legacy: pointer to a `BasicLock`.
    pub fn is_stack_locked(self) -> bool {
        self.lock_bits() == LockBits::Locked && self != Self::INFLATING
    }

    /// Lightweight: locked without a monitor, hash bits kept in place.
    pub fn is_fast_locked(self) -> bool {
        self.lock_bits() == LockBits::Locked
    }

    pub fn is_inflating(self) -> bool {
        self == Self::INFLATING
    }

    pub fn has_monitor(self) -> bool {
        self.lock_bits() == LockBits::Monitor
    }

    pub fn hash(self) -> IdentityHash {
        HashField::decode(self.0)
    }

    pub fn has_hash(self) -> bool {
        self.hash() != IdentityHash(0)
    }

    pub(crate) fn copy_set_hash(self, hash: IdentityHash) -> Self {
        Self(HashField::update(IdentityHash(hash.0 & HASH_MASK), self.0))
    }

    fn with_lock_bits(self, bits: LockBits) -> Self {
        Self(LockBitsField::update(bits, self.0))
    }

    pub(crate) fn set_unlocked(self) -> Self {
        self.with_lock_bits(LockBits::Unlocked)
    }

    pub(crate) fn set_fast_locked(self) -> Self {
        self.with_lock_bits(LockBits::Locked)
    }

    /// Table mode: keeps the hash in place and only flips the lock bits.
    pub(crate) fn set_has_monitor(self) -> Self {
        self.with_lock_bits(LockBits::Monitor)
    }

    pub(crate) fn encode_stack_lock(lock_address: usize) -> Self {
        debug_assert_eq!(lock_address & LOCK_MASK, 0, "lock record must be word aligned");
        Self(lock_address)
    }

    pub fn locker(self) -> usize {
        debug_assert!(self.is_stack_locked());
        self.0
    }

    pub(crate) fn encode_monitor(monitor: *const ObjectMonitor) -> Self {
        let address = monitor as usize;
        debug_assert_eq!(address & LOCK_MASK, 0, "monitor must be word aligned");
        Self(address | LockBits::Monitor as usize)
    }

    pub fn monitor_ptr(self) -> *const ObjectMonitor {
        debug_assert!(self.has_monitor());
        (self.0 & !LOCK_MASK) as *const ObjectMonitor
    }
}

impl fmt::Debug for LockStateWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockStateWord({:#x}, {:?})", self.0, self.lock_bits())
    }
}

pub struct HeapObjectHeader {
    mark: AtomicUsize,
    class: &'static Class,
}

impl HeapObjectHeader {
    pub fn new(class: &'static Class) -> Self {
        Self {
            mark: AtomicUsize::new(LockStateWord::unlocked().value()),
            class,
        }
    }

    pub fn class(&self) -> &'static Class {
        self.class
    }

    pub fn mark(&self) -> LockStateWord {
        LockStateWord(self.mark.load(Ordering::Acquire))
    }

    pub(crate) fn release_set_mark(&self, mark: LockStateWord) {
        self.mark.store(mark.0, Ordering::Release);
    }

    /// Returns the witnessed value either way, like a raw CAS.
    pub(crate) fn cas_set_mark(
        &self,
        new: LockStateWord,
        expected: LockStateWord,
    ) -> Result<LockStateWord, LockStateWord> {
        self.mark
            .compare_exchange(expected.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(LockStateWord)
            .map_err(LockStateWord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocked_word_shape() {
        let mark = LockStateWord::unlocked();
        assert!(mark.is_unlocked());
        assert!(!mark.has_hash());
        assert!(!mark.has_monitor());
        assert!(!mark.is_stack_locked());
    }

    #[test]
    fn hash_survives_lock_bit_changes() {
        let mark = LockStateWord::unlocked().copy_set_hash(IdentityHash(0x1234_5678));
        assert_eq!(mark.hash(), IdentityHash(0x1234_5678 & HASH_MASK));

        let fast = mark.set_fast_locked();
        assert!(fast.is_fast_locked());
        assert_eq!(fast.hash(), mark.hash());

        let table = fast.set_has_monitor();
        assert!(table.has_monitor());
        assert_eq!(table.set_unlocked(), mark);
    }

    #[test]
    fn inflating_is_not_a_stack_lock() {
        assert!(LockStateWord::INFLATING.is_inflating());
        assert!(!LockStateWord::INFLATING.is_stack_locked());
        assert!(LockStateWord::encode_stack_lock(0x1000).is_stack_locked());
        assert_eq!(LockStateWord::encode_stack_lock(0x1000).locker(), 0x1000);
    }

    #[test]
    fn monitor_pointer_round_trip() {
        let fake = 0xdead_bee0usize as *const ObjectMonitor;
        let mark = LockStateWord::encode_monitor(fake);
        assert!(mark.has_monitor());
        assert_eq!(mark.monitor_ptr(), fake);
    }
}
