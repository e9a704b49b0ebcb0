//! Invoke-id allocation.
//!
//! A confirmed request is identified on the wire by a single octet. Values
//! 0..=254 are issued; 255 is reserved to mean "no invoke id".

use thiserror::Error;

/// Invoke-id value that never identifies a transaction
pub const NO_INVOKE_ID: u8 = 255;

const ID_COUNT: usize = 255;

/// Every id in 0..=254 is held by a live originator transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all invoke ids are in use")]
pub struct Exhausted;

/// Allocator over the invoke-id namespace.
///
/// Scanning starts after the most recently issued id, so an id released by a
/// timeout is the last to come back while a late reply may still be on the
/// wire.
#[derive(Debug, Clone)]
pub struct InvokeIdAllocator {
    in_use: [u64; 4],
    cursor: u8,
    live: usize,
}

impl Default for InvokeIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl InvokeIdAllocator {
    pub fn new() -> Self {
        Self {
            in_use: [0; 4],
            cursor: 0,
            live: 0,
        }
    }

    /// Start the rolling scan at `first` instead of 0
    #[cfg(test)]
    pub fn starting_at(first: u8) -> Self {
        Self {
            cursor: if first == NO_INVOKE_ID { 0 } else { first },
            ..Self::new()
        }
    }

    fn mask(id: u8) -> (usize, u64) {
        ((id / 64) as usize, 1u64 << (id % 64))
    }

    /// Check whether `id` is held by a live transaction
    pub fn is_in_use(&self, id: u8) -> bool {
        if id == NO_INVOKE_ID {
            return false;
        }
        let (word, bit) = Self::mask(id);
        self.in_use[word] & bit != 0
    }

    /// Number of ids currently held
    pub fn in_use_count(&self) -> usize {
        self.live
    }

    /// Issue the next free id, marking it in use.
    pub fn next_free(&mut self) -> Result<u8, Exhausted> {
        if self.live == ID_COUNT {
            return Err(Exhausted);
        }

        for offset in 0..ID_COUNT {
            let id = ((self.cursor as usize + offset) % ID_COUNT) as u8;
            if !self.is_in_use(id) {
                let (word, bit) = Self::mask(id);
                self.in_use[word] |= bit;
                self.live += 1;
                self.cursor = ((id as usize + 1) % ID_COUNT) as u8;
                return Ok(id);
            }
        }

        Err(Exhausted)
    }

    /// Return `id` to the pool. Releasing a free id has no effect.
    pub fn release(&mut self, id: u8) {
        if !self.is_in_use(id) {
            return;
        }
        let (word, bit) = Self::mask(id);
        self.in_use[word] &= !bit;
        self.live -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_ids_are_unique_until_exhausted() {
        let mut allocator = InvokeIdAllocator::new();
        let mut seen = BTreeSet::new();
        for _ in 0..255 {
            let id = allocator.next_free().unwrap();
            assert_ne!(id, NO_INVOKE_ID);
            assert!(seen.insert(id));
        }
        assert_eq!(allocator.next_free(), Err(Exhausted));
        assert_eq!(allocator.in_use_count(), 255);
    }

    #[test]
    fn test_rolling_cursor_does_not_reissue_immediately() {
        let mut allocator = InvokeIdAllocator::new();
        let first = allocator.next_free().unwrap();
        allocator.release(first);
        let second = allocator.next_free().unwrap();
        assert_ne!(first, second);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_wraps_to_released_ids() {
        let mut allocator = InvokeIdAllocator::starting_at(250);
        for expected in 250..=254 {
            assert_eq!(allocator.next_free().unwrap(), expected);
        }
        assert_eq!(allocator.next_free().unwrap(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut allocator = InvokeIdAllocator::new();
        let id = allocator.next_free().unwrap();
        allocator.release(id);
        allocator.release(id);
        allocator.release(NO_INVOKE_ID);
        assert_eq!(allocator.in_use_count(), 0);
        assert!(!allocator.is_in_use(id));
    }

    proptest! {
        #[test]
        fn live_ids_never_collide(ops in proptest::collection::vec(any::<Option<u8>>(), 1..600)) {
            let mut allocator = InvokeIdAllocator::new();
            let mut live = BTreeSet::new();

            for op in ops {
                match op {
                    None => {
                        match allocator.next_free() {
                            Ok(id) => prop_assert!(live.insert(id), "id {} issued twice", id),
                            Err(Exhausted) => prop_assert_eq!(live.len(), 255),
                        }
                    }
                    Some(pick) => {
                        if let Some(&id) = live.iter().nth(pick as usize % live.len().max(1)) {
                            allocator.release(id);
                            live.remove(&id);
                        }
                    }
                }
                prop_assert_eq!(allocator.in_use_count(), live.len());
            }
        }
    }
}
