//! Per-thread allocation fast path.  Every method except the central
//! heap calls inside the `refill_*`/`allocate_large`/`allocate_xlarge`
//! helpers touches only this struct's own fields: no locking, no
//! atomics.
use crate::bump::{BumpAllocator, BumpRange, BumpRangeCache};
use crate::deallocator::Deallocator;
use crate::error::fatal;
use crate::heap::HEAP;
use crate::size_class::{self, MediumSizeClass, Regime, SmallSizeClass};
use crate::vm;
use std::ptr::NonNull;

pub struct Allocator {
    small_bump: Vec<BumpAllocator>,
    small_cache: Vec<BumpRangeCache>,
    medium_bump: Vec<BumpAllocator>,
    medium_cache: Vec<BumpRangeCache>,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator {
            small_bump: vec![BumpAllocator::default(); size_class::NUM_SMALL_CLASSES],
            small_cache: (0..size_class::NUM_SMALL_CLASSES).map(|_| BumpRangeCache::default()).collect(),
            medium_bump: vec![BumpAllocator::default(); size_class::NUM_MEDIUM_CLASSES],
            medium_cache: (0..size_class::NUM_MEDIUM_CLASSES).map(|_| BumpRangeCache::default()).collect(),
        }
    }

    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        match size_class::regime_for(size) {
            Regime::Small => self.allocate_small(size),
            Regime::Medium => self.allocate_medium(size),
            Regime::Large => self.allocate_large(size),
            Regime::XLarge => self.allocate_xlarge(size),
        }
    }

    /// Services a request for `size` bytes aligned to `alignment`
    /// (a power of two).  Alignments no larger than the natural
    /// object alignment fall straight through to `allocate`; anything
    /// up to a VM page rides the Large path, which is always
    /// page-aligned; anything larger gets its own aligned reservation.
    pub fn allocate_aligned(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        debug_assert!(alignment.is_power_of_two());

        if alignment <= size_class::ALIGNMENT {
            return self.allocate(size);
        }

        if alignment <= vm::page_size() {
            return self.allocate_large(size.max(alignment));
        }

        let mut heap = HEAP.lock().unwrap();
        heap.allocate_xlarge_aligned(size, alignment)
            .unwrap_or_else(|e| fatal!("allocate_xlarge_aligned failed: {}", e))
    }

    fn allocate_small(&mut self, size: usize) -> NonNull<u8> {
        let class = size_class::small_size_class_for(size);
        let index = class.0 as usize;

        if !self.small_bump[index].can_allocate() {
            self.refill_small(class);
        }

        let address = self.small_bump[index].allocate();
        unsafe { NonNull::new_unchecked(address as *mut u8) }
    }

    fn allocate_medium(&mut self, size: usize) -> NonNull<u8> {
        let class = size_class::medium_size_class_for(size);
        let index = class.0 as usize;

        if !self.medium_bump[index].can_allocate() {
            self.refill_medium(class);
        }

        let address = self.medium_bump[index].allocate();
        unsafe { NonNull::new_unchecked(address as *mut u8) }
    }

    fn refill_small(&mut self, class: SmallSizeClass) {
        let index = class.0 as usize;
        if self.small_cache[index].is_empty() {
            let mut heap = HEAP.lock().unwrap();
            heap.refill_small_bump_range_cache(class, &mut self.small_cache[index])
                .unwrap_or_else(|e| fatal!("refill_small_bump_range_cache failed: {}", e));
        }

        let range = self.small_cache[index]
            .pop()
            .unwrap_or_else(|| fatal!("small bump range cache empty after refill"));
        let object_size = size_class::small_object_size(class);
        self.small_bump[index].refill(range, object_size);
    }

    fn refill_medium(&mut self, class: MediumSizeClass) {
        let index = class.0 as usize;
        if self.medium_cache[index].is_empty() {
            let mut heap = HEAP.lock().unwrap();
            heap.refill_medium_bump_range_cache(class, &mut self.medium_cache[index])
                .unwrap_or_else(|e| fatal!("refill_medium_bump_range_cache failed: {}", e));
        }

        let range = self.medium_cache[index]
            .pop()
            .unwrap_or_else(|| fatal!("medium bump range cache empty after refill"));
        let object_size = size_class::medium_object_size(class);
        self.medium_bump[index].refill(range, object_size);
    }

    fn allocate_large(&mut self, size: usize) -> NonNull<u8> {
        let mut heap = HEAP.lock().unwrap();
        heap.allocate_large(size).unwrap_or_else(|e| fatal!("allocate_large failed: {}", e))
    }

    fn allocate_xlarge(&mut self, size: usize) -> NonNull<u8> {
        let mut heap = HEAP.lock().unwrap();
        heap.allocate_xlarge(size).unwrap_or_else(|e| fatal!("allocate_xlarge failed: {}", e))
    }

    /// Gives every byte of spare capacity back to `deallocator`, one
    /// object at a time, the same way the original `Allocator`
    /// drains itself on thread exit: there is no bulk "unreserve"
    /// operation, so each slot is individually freed.
    pub fn scavenge(&mut self, deallocator: &mut Deallocator) {
        for (index, bump) in self.small_bump.iter_mut().enumerate() {
            let object_size = size_class::small_object_size(SmallSizeClass(index as u32));
            if let Some(range) = bump.drain() {
                drain_range(range, object_size, deallocator);
            }
        }
        for (index, cache) in self.small_cache.iter_mut().enumerate() {
            let object_size = size_class::small_object_size(SmallSizeClass(index as u32));
            while let Some(range) = cache.pop() {
                drain_range(range, object_size, deallocator);
            }
        }

        for (index, bump) in self.medium_bump.iter_mut().enumerate() {
            let object_size = size_class::medium_object_size(MediumSizeClass(index as u32));
            if let Some(range) = bump.drain() {
                drain_range(range, object_size, deallocator);
            }
        }
        for (index, cache) in self.medium_cache.iter_mut().enumerate() {
            let object_size = size_class::medium_object_size(MediumSizeClass(index as u32));
            while let Some(range) = cache.pop() {
                drain_range(range, object_size, deallocator);
            }
        }

        deallocator.scavenge();
    }
}

fn drain_range(range: BumpRange, object_size: usize, deallocator: &mut Deallocator) {
    for i in 0..range.object_count {
        let address = range.begin + i as usize * object_size;
        deallocator.deallocate(Some(unsafe { NonNull::new_unchecked(address as *mut u8) }));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_small_distinct_pointers() {
        let mut allocator = Allocator::new();
        let mut dealloc = Deallocator::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            let ptr = allocator.allocate(24);
            assert!(seen.insert(ptr.as_ptr() as usize), "duplicate pointer handed out");
        }
        allocator.scavenge(&mut dealloc);
    }

    #[test]
    fn allocate_medium_and_large_and_xlarge() {
        let mut allocator = Allocator::new();
        let mut dealloc = Deallocator::new();

        let medium = allocator.allocate(600);
        let large = allocator.allocate(1024 * 1024);
        let xlarge = allocator.allocate(8 * 1024 * 1024 + 1);

        assert_ne!(medium.as_ptr(), large.as_ptr());
        assert_ne!(large.as_ptr(), xlarge.as_ptr());

        dealloc.deallocate(Some(medium));
        dealloc.deallocate(Some(large));
        dealloc.deallocate(Some(xlarge));
        dealloc.scavenge();
        allocator.scavenge(&mut dealloc);
    }

    #[test]
    fn allocate_aligned_respects_alignment() {
        let mut allocator = Allocator::new();
        let mut dealloc = Deallocator::new();

        let ptr = allocator.allocate_aligned(100, 4096);
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        dealloc.deallocate(Some(ptr));
        dealloc.scavenge();
        allocator.scavenge(&mut dealloc);
    }
}
