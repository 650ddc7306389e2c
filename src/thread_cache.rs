//! Owns the per-thread `Allocator`/`Deallocator` pair and guarantees
//! they are drained back into the central heap when the thread exits,
//! even for threads that never call anything else in this crate
//! explicitly.  Mirrors the `thread_local!` + `Drop` registry pattern
//! used to retire per-thread caches in this allocator family.
use crate::allocator::Allocator;
use crate::deallocator::Deallocator;
use std::cell::RefCell;
use std::ptr::NonNull;

struct ThreadCache {
    allocator: Allocator,
    deallocator: Deallocator,
}

impl ThreadCache {
    fn new() -> Self {
        ThreadCache {
            allocator: Allocator::new(),
            deallocator: Deallocator::new(),
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.allocator.scavenge(&mut self.deallocator);
    }
}

thread_local! {
    static CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new());
}

/// A thread whose TLS destructors have already run (this only happens
/// very late in process or thread teardown) gets a throwaway cache
/// for that one call instead of a panic; it is dropped, and therefore
/// scavenged, immediately after.
fn with_fallback<R>(f: impl FnOnce(&mut Allocator, &mut Deallocator) -> R) -> R {
    let mut cache = ThreadCache::new();
    let result = f(&mut cache.allocator, &mut cache.deallocator);
    result
}

pub fn allocate(size: usize) -> NonNull<u8> {
    CACHE
        .try_with(|cache| cache.borrow_mut().allocator.allocate(size))
        .unwrap_or_else(|_| with_fallback(|allocator, _| allocator.allocate(size)))
}

pub fn allocate_aligned(size: usize, alignment: usize) -> NonNull<u8> {
    CACHE
        .try_with(|cache| cache.borrow_mut().allocator.allocate_aligned(size, alignment))
        .unwrap_or_else(|_| with_fallback(|allocator, _| allocator.allocate_aligned(size, alignment)))
}

pub fn deallocate(pointer: Option<NonNull<u8>>) {
    let result = CACHE.try_with(|cache| cache.borrow_mut().deallocator.deallocate(pointer));
    if result.is_err() {
        with_fallback(|_, deallocator| deallocator.deallocate(pointer));
    }
}

pub fn object_size_of(address: usize) -> usize {
    crate::heap::HEAP.lock().unwrap().object_size_of(address)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_and_deallocate_through_tls() {
        let ptr = allocate(48);
        deallocate(Some(ptr));
    }
}
