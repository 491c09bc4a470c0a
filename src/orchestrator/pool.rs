//! Acquisition ledger of a barrier group.
//!
//! The [`GuestPool`] remembers in which order the entries of a group got
//! their guests, so teardown can release them in reverse acquisition order.

/// Entry indexes of one group, in the order their guests became ready.
///
/// # Example
///
/// ```
/// use guestfarm::orchestrator::GuestPool;
///
/// let mut pool = GuestPool::new();
/// pool.add(2);
/// pool.add(0);
///
/// assert_eq!(pool.take_release_order(), vec![0, 2]);
/// assert!(pool.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct GuestPool {
    acquired: Vec<usize>,
}

impl GuestPool {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new ledger with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            acquired: Vec::with_capacity(capacity),
        }
    }

    /// Records that the guest of entry `index` is ready.
    ///
    /// Recording the same entry twice has no effect.
    pub fn add(&mut self, index: usize) {
        if !self.contains(index) {
            self.acquired.push(index);
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.acquired.contains(&index)
    }

    /// Entry indexes in acquisition order.
    pub fn acquired(&self) -> &[usize] {
        &self.acquired
    }

    /// Empties the ledger, returning the entries newest first.
    pub fn take_release_order(&mut self) -> Vec<usize> {
        let mut order = std::mem::take(&mut self.acquired);
        order.reverse();
        order
    }

    pub fn len(&self) -> usize {
        self.acquired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_ignored() {
        let mut pool = GuestPool::with_capacity(2);
        pool.add(1);
        pool.add(1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_release_order_is_reverse_acquisition() {
        let mut pool = GuestPool::new();
        for index in [3, 1, 2] {
            pool.add(index);
        }
        assert_eq!(pool.acquired(), &[3, 1, 2]);
        assert_eq!(pool.take_release_order(), vec![2, 1, 3]);
        assert!(pool.take_release_order().is_empty());
    }
}
