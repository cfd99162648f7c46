use std::sync::atomic::{AtomicUsize, Ordering};

/// Small per-thread stack of lock entries.
///
/// Lightweight locking pushes the address of every object it fast-locks,
/// legacy locking pushes the address of every `BasicLock` it stack-locks
/// with. Only the owning thread mutates a stack; other threads may read it
/// (for `lock_owner`) and will see a slightly stale but well-formed view.
pub struct LockStack {
    top: AtomicUsize,
    base: [AtomicUsize; LockStack::CAPACITY],
}

impl LockStack {
    pub const CAPACITY: usize = 8;

    pub const fn new() -> Self {
        Self {
            top: AtomicUsize::new(0),
            base: [const { AtomicUsize::new(0) }; Self::CAPACITY],
        }
    }

    fn end(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    fn get(&self, index: usize) -> usize {
        self.base[index].load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.end()
    }

    pub fn is_empty(&self) -> bool {
        self.end() == 0
    }

    pub fn is_full(&self) -> bool {
        self.end() == Self::CAPACITY
    }

    pub fn push(&self, entry: usize) {
        let end = self.end();
        assert!(end < Self::CAPACITY, "lock stack overflow");
        self.base[end].store(entry, Ordering::Relaxed);
        self.top.store(end + 1, Ordering::Release);
    }

    pub fn top(&self) -> Option<usize> {
        match self.end() {
            0 => None,
            end => Some(self.get(end - 1)),
        }
    }

    pub fn bottom(&self) -> Option<usize> {
        (!self.is_empty()).then(|| self.get(0))
    }

    /// True iff `entry` occurs at least twice in a row.
    pub fn is_recursive(&self, entry: usize) -> bool {
        let end = self.end();

        // Entries for one lock form a single consecutive run, and balanced
        // locking keeps the interesting run at the top.
        for i in (1..end).rev() {
            if self.get(i - 1) == entry && self.get(i) == entry {
                return true;
            }
            if self.get(i) == entry {
                break;
            }
        }

        false
    }

    /// Pushes `entry` again if it is already on top and there is room.
    pub fn try_recursive_enter(&self, entry: usize) -> bool {
        let end = self.end();
        if end == 0 || end == Self::CAPACITY || self.get(end - 1) != entry {
            return false;
        }

        self.base[end].store(entry, Ordering::Relaxed);
        self.top.store(end + 1, Ordering::Release);
        true
    }

    /// Pops the top entry if it and the one below it are both `entry`.
    pub fn try_recursive_exit(&self, entry: usize) -> bool {
        let end = self.end();
        if end <= 1 || self.get(end - 1) != entry || self.get(end - 2) != entry {
            return false;
        }

        self.top.store(end - 1, Ordering::Release);
        true
    }

    /// Removes every occurrence of `entry` and returns how many there were.
    pub fn remove(&self, entry: usize) -> usize {
        let end = self.end();
        let mut inserted = 0;

        for i in 0..end {
            let value = self.get(i);
            if value != entry {
                if inserted != i {
                    self.base[inserted].store(value, Ordering::Relaxed);
                }
                inserted += 1;
            }
        }

        self.top.store(inserted, Ordering::Release);
        end - inserted
    }

    pub fn contains(&self, entry: usize) -> bool {
        (0..self.end()).any(|i| self.get(i) == entry)
    }

    pub fn count(&self, entry: usize) -> usize {
        (0..self.end()).filter(|&i| self.get(i) == entry).count()
    }
}

impl Default for LockStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_runs() {
        let stack = LockStack::new();
        assert!(!stack.try_recursive_enter(0x10));

        stack.push(0x10);
        assert!(!stack.is_recursive(0x10));
        assert!(stack.try_recursive_enter(0x10));
        assert!(stack.is_recursive(0x10));

        stack.push(0x20);
        assert!(!stack.try_recursive_enter(0x10));
        assert!(stack.is_recursive(0x10));
        assert!(!stack.is_recursive(0x20));

        assert!(!stack.try_recursive_exit(0x20));
        assert_eq!(stack.remove(0x20), 1);
        assert!(stack.try_recursive_exit(0x10));
        assert_eq!(stack.len(), 1);
        assert!(!stack.try_recursive_exit(0x10));
    }

    #[test]
    fn single_entry_at_bottom_is_not_recursive() {
        let stack = LockStack::new();
        stack.push(0x30);
        stack.push(0x40);
        assert!(!stack.is_recursive(0x30));
        assert_eq!(stack.bottom(), Some(0x30));
        assert_eq!(stack.top(), Some(0x40));
    }

    #[test]
    fn fills_up() {
        let stack = LockStack::new();
        for i in 0..LockStack::CAPACITY {
            stack.push(0x100 + i * 8);
        }
        assert!(stack.is_full());
        assert!(!stack.try_recursive_enter(0x100 + (LockStack::CAPACITY - 1) * 8));

        assert_eq!(stack.remove(0x100), 1);
        assert!(!stack.is_full());
        assert_eq!(stack.bottom(), Some(0x108));
        assert_eq!(stack.count(0x108), 1);
    }

    #[test]
    #[should_panic(expected = "lock stack overflow")]
    fn push_past_capacity_panics() {
        let stack = LockStack::new();
        for i in 0..=LockStack::CAPACITY {
            stack.push(i * 8);
        }
    }
}
