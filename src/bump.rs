//! The lock-free fast path: a bump pointer plus a remaining count, and
//! a small thread-owned cache of pre-sliced ranges to refill it from
//! without touching the central lock on every exhaustion.
//!
//! Mirrors the two-level `BumpAllocator` / per-class range cache split
//! in the original `Allocator`, but the cache here holds a handful of
//! ranges per class rather than a single slot, to amortize refill
//! further.

/// A single contiguous run of free, same-size object slots, handed
/// out by the central heap to refill a `BumpAllocator`.
#[derive(Debug, Clone, Copy)]
pub struct BumpRange {
    pub begin: usize,
    pub object_count: u32,
}

/// A thread-local bump pointer for one size class.  Never touches the
/// central lock; refilled from a `BumpRangeCache` when exhausted.
#[derive(Debug, Clone, Copy, Default)]
pub struct BumpAllocator {
    begin: usize,
    remaining: u32,
    object_size: u32,
}

impl BumpAllocator {
    pub fn can_allocate(&self) -> bool {
        self.remaining > 0
    }

    /// Bumps the pointer and returns the slot that was just claimed.
    /// Caller must check `can_allocate` first.
    #[inline]
    pub fn allocate(&mut self) -> usize {
        debug_assert!(self.can_allocate());
        let object = self.begin;
        self.begin += self.object_size as usize;
        self.remaining -= 1;
        object
    }

    /// Refills this allocator from a fresh range, returning whatever
    /// was left unallocated (normally nothing, since allocators are
    /// only refilled once drained).
    pub fn refill(&mut self, range: BumpRange, object_size: usize) {
        self.begin = range.begin;
        self.remaining = range.object_count;
        self.object_size = object_size as u32;
    }

    /// Drains any remaining capacity, turning it back into a range for
    /// the deallocator to give back to the heap.  Returns `None` if
    /// nothing was left.
    pub fn drain(&mut self) -> Option<BumpRange> {
        if self.remaining == 0 {
            return None;
        }
        let range = BumpRange {
            begin: self.begin,
            object_count: self.remaining,
        };
        self.remaining = 0;
        Some(range)
    }
}

/// Per-thread, per-size-class cache of ranges not yet handed to the
/// `BumpAllocator`.  Bounded so a refill never has to ask the central
/// heap for an unbounded amount of work.
#[derive(Debug, Default)]
pub struct BumpRangeCache {
    ranges: Vec<BumpRange>,
}

/// Refills fetch at most this many ranges per central-lock acquisition.
pub const BUMP_RANGE_CACHE_CAPACITY: usize = 4;

impl BumpRangeCache {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn pop(&mut self) -> Option<BumpRange> {
        self.ranges.pop()
    }

    /// Pushes a fresh range.  Not capacity-checked: a single
    /// recycled page can yield more ranges than `has_room` would
    /// suggest, and dropping one on the floor would leak address
    /// space, so the target capacity below is advisory only.
    pub fn push(&mut self, range: BumpRange) {
        self.ranges.push(range);
    }

    pub fn has_room(&self) -> bool {
        self.ranges.len() < BUMP_RANGE_CACHE_CAPACITY
    }

    /// Drains every cached range, in LIFO order, into `sink`.
    pub fn drain_into(&mut self, sink: &mut Vec<BumpRange>) {
        sink.append(&mut self.ranges);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Refilling a BumpAllocator from a range of `object_count` objects
    // of `object_size` bytes must yield exactly `object_count` distinct,
    // increasing, evenly-spaced addresses, then refuse to allocate.
    proptest! {
        #[test]
        fn refill_yields_exactly_object_count_slots(
            object_count in 1u32..10_000,
            object_size in 1usize..256,
        ) {
            let mut bump = BumpAllocator::default();
            bump.refill(BumpRange { begin: 0x4000, object_count }, object_size);

            let mut previous: Option<usize> = None;
            for _ in 0..object_count {
                prop_assert!(bump.can_allocate());
                let address = bump.allocate();
                if let Some(prev) = previous {
                    prop_assert_eq!(address - prev, object_size);
                }
                previous = Some(address);
            }
            prop_assert!(!bump.can_allocate());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_advances_and_exhausts() {
        let mut bump = BumpAllocator::default();
        bump.refill(BumpRange { begin: 0x1000, object_count: 3 }, 16);

        assert!(bump.can_allocate());
        assert_eq!(bump.allocate(), 0x1000);
        assert_eq!(bump.allocate(), 0x1010);
        assert_eq!(bump.allocate(), 0x1020);
        assert!(!bump.can_allocate());
    }

    #[test]
    fn drain_returns_leftover() {
        let mut bump = BumpAllocator::default();
        bump.refill(BumpRange { begin: 0x2000, object_count: 5 }, 32);
        bump.allocate();
        bump.allocate();

        let leftover = bump.drain().expect("should have leftover capacity");
        assert_eq!(leftover.begin, 0x2040);
        assert_eq!(leftover.object_count, 3);
        assert!(bump.drain().is_none());
    }

    #[test]
    fn cache_is_lifo_and_bounded() {
        let mut cache = BumpRangeCache::default();
        for i in 0..BUMP_RANGE_CACHE_CAPACITY {
            assert!(cache.has_room());
            cache.push(BumpRange { begin: i, object_count: 1 });
        }
        assert!(!cache.has_room());

        let mut drained = 0;
        while let Some(_) = cache.pop() {
            drained += 1;
        }
        assert_eq!(drained, BUMP_RANGE_CACHE_CAPACITY);
        assert!(cache.is_empty());
    }
}
