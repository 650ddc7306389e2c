//! Boundary-tagged coalescing for Large ranges.
//!
//! The original boundary-tag protocol writes a tag into the first and
//! last words of every range so a neighbor can be inspected without a
//! side table.  This crate hands callers plain pointers with no
//! reserved trailer, so tags instead live in a `BTreeMap` keyed by a
//! range's starting address, one entry per chunk.  Looking up the
//! entry immediately below or at `begin + size` is the in-memory
//! equivalent of reading the previous End tag / next Begin tag.
use std::collections::BTreeMap;

/// Metadata for one contiguous range: either free and coalescible, or
/// allocated and opaque to this module.
#[derive(Debug, Clone, Copy)]
pub struct RangeTag {
    pub size: usize,
    pub is_free: bool,
    pub has_physical_pages: bool,
}

/// One large, power-of-two-aligned VM reservation, subdivided into
/// adjacent ranges tracked by `tags`.  A fresh chunk starts as a
/// single free range spanning the whole reservation.
pub struct LargeChunk {
    pub base: usize,
    pub size: usize,
    tags: BTreeMap<usize, RangeTag>,
}

impl LargeChunk {
    pub fn new(base: usize, size: usize) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(
            base,
            RangeTag {
                size,
                is_free: true,
                has_physical_pages: false,
            },
        );
        LargeChunk { base, size, tags }
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn tag_at(&self, begin: usize) -> Option<RangeTag> {
        self.tags.get(&begin).copied()
    }

    /// Finds the range immediately preceding `begin`, if any exists
    /// and is within this chunk.
    fn predecessor(&self, begin: usize) -> Option<(usize, RangeTag)> {
        let (&pred_begin, &tag) = self.tags.range(..begin).next_back()?;
        if pred_begin + tag.size == begin {
            Some((pred_begin, tag))
        } else {
            None
        }
    }

    /// Splits the free range starting at `begin` into an allocated
    /// prefix of `size` bytes and a (possibly empty) free suffix.
    /// Returns whether the prefix's physical pages were already
    /// resident, and the suffix's `(begin, size)` if non-empty.
    ///
    /// Panics (via the heap's fatal-abort convention) if `begin` does
    /// not name a free range of at least `size` bytes; that is an
    /// invariant violation in the caller, not a normal error.
    pub fn allocate(
        &mut self,
        begin: usize,
        size: usize,
    ) -> (bool, Option<(usize, usize)>) {
        let existing = match self.tags.remove(&begin) {
            Some(tag) if tag.is_free && tag.size >= size => tag,
            _ => crate::error::fatal!("boundary tag allocate: no matching free range at {:#x}", begin),
        };

        let has_physical_pages = existing.has_physical_pages;
        self.tags.insert(
            begin,
            RangeTag {
                size,
                is_free: false,
                has_physical_pages: true,
            },
        );

        let leftover_size = existing.size - size;
        if leftover_size == 0 {
            return (has_physical_pages, None);
        }

        let leftover_begin = begin + size;
        self.tags.insert(
            leftover_begin,
            RangeTag {
                size: leftover_size,
                is_free: true,
                has_physical_pages,
            },
        );
        (has_physical_pages, Some((leftover_begin, leftover_size)))
    }

    /// Marks the range at `begin` free and coalesces with both
    /// neighbors, if free.  Returns the coalesced range's `(begin, size)`.
    pub fn deallocate(&mut self, begin: usize) -> (usize, usize) {
        let tag = match self.tags.get(&begin).copied() {
            Some(t) if !t.is_free => t,
            _ => crate::error::fatal!("boundary tag deallocate: {:#x} is not an allocated range", begin),
        };

        let mut new_begin = begin;
        let mut new_size = tag.size;
        let mut has_physical_pages = tag.has_physical_pages;

        if let Some((pred_begin, pred_tag)) = self.predecessor(begin) {
            if pred_tag.is_free {
                self.tags.remove(&pred_begin);
                new_begin = pred_begin;
                new_size += pred_tag.size;
                has_physical_pages = has_physical_pages && pred_tag.has_physical_pages;
            }
        }

        let successor_begin = begin + tag.size;
        if let Some(succ_tag) = self.tags.get(&successor_begin).copied() {
            if succ_tag.is_free {
                self.tags.remove(&successor_begin);
                new_size += succ_tag.size;
                has_physical_pages = has_physical_pages && succ_tag.has_physical_pages;
            }
        }

        self.tags.insert(
            new_begin,
            RangeTag {
                size: new_size,
                is_free: true,
                has_physical_pages,
            },
        );
        (new_begin, new_size)
    }

    /// Marks the physical pages of the range at `begin` as released,
    /// for the scavenger.  Leaves the tag's `size`/`is_free` untouched.
    pub fn mark_pages_idle(&mut self, begin: usize) {
        if let Some(tag) = self.tags.get_mut(&begin) {
            tag.has_physical_pages = false;
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Allocate and free a random sequence of fixed-size slices of one
    // chunk, in random order, and check that every allocated slice is
    // disjoint from every other, and that the chunk always ends up
    // back as a single free range spanning the whole reservation once
    // everything is freed.
    proptest! {
        #[test]
        fn random_alloc_free_order_fully_coalesces(
            slice_count in 1usize..16,
            seed in any::<u64>(),
        ) {
            let slice_size = LARGE_ALIGNMENT_FOR_TEST;
            let chunk_size = slice_size * slice_count;
            let base = 0x1_0000_0000usize;
            let mut chunk = LargeChunk::new(base, chunk_size);

            let mut begins: Vec<usize> = (0..slice_count).map(|i| base + i * slice_size).collect();
            // Deterministic shuffle from the proptest-supplied seed.
            let mut state = seed;
            for i in (1..begins.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let j = (state >> 33) as usize % (i + 1);
                begins.swap(i, j);
            }

            for &begin in &begins {
                let (_, leftover) = chunk.allocate(begin, slice_size);
                prop_assert!(leftover.is_none());
            }

            for &begin in &begins {
                chunk.deallocate(begin);
            }

            let tag = chunk.tag_at(base).expect("fully freed chunk should have one range at its base");
            prop_assert_eq!(tag.size, chunk_size);
            prop_assert!(tag.is_free);
        }
    }

    const LARGE_ALIGNMENT_FOR_TEST: usize = 4096;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_splits_and_deallocate_coalesces() {
        let mut chunk = LargeChunk::new(0x10000, 0x3000);

        let (had_pages, leftover) = chunk.allocate(0x10000, 0x1000);
        assert!(!had_pages);
        assert_eq!(leftover, Some((0x11000, 0x2000)));

        let (_, leftover2) = chunk.allocate(0x11000, 0x1000);
        assert_eq!(leftover2, Some((0x12000, 0x1000)));

        // Three allocated-looking regions: [0x10000,0x1000) [0x11000,0x1000) [0x12000,0x1000)
        // free the middle one, then the first: they should coalesce.
        let (b1, s1) = chunk.deallocate(0x11000);
        assert_eq!((b1, s1), (0x11000, 0x1000));

        let (b2, s2) = chunk.deallocate(0x10000);
        assert_eq!((b2, s2), (0x10000, 0x2000));

        let (b3, s3) = chunk.deallocate(0x12000);
        assert_eq!((b3, s3), (0x10000, 0x3000));
    }

    #[test]
    fn no_split_when_exact_fit() {
        let mut chunk = LargeChunk::new(0x20000, 0x1000);
        let (_, leftover) = chunk.allocate(0x20000, 0x1000);
        assert!(leftover.is_none());
    }
}
