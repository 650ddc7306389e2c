//! Per-thread deallocation: a bounded log of freed pointers, drained
//! under the central lock once full so the cost of acquiring it is
//! amortized across many frees.
use crate::error::fatal;
use crate::heap::{AddressKind, Heap, HEAP};
use std::ptr::NonNull;

/// Number of pending frees buffered before a drain.
const LOG_CAPACITY: usize = 256;

pub struct Deallocator {
    log: Vec<NonNull<u8>>,
}

// A NonNull<u8> is just an address to us; every pointer in the log
// was returned by this crate's own allocator and is never aliased
// while it sits in the log.
unsafe impl Send for Deallocator {}

impl Deallocator {
    pub fn new() -> Self {
        Deallocator { log: Vec::with_capacity(LOG_CAPACITY) }
    }

    /// Frees `pointer`.  `None` is a no-op, matching `free(NULL)`.
    pub fn deallocate(&mut self, pointer: Option<NonNull<u8>>) {
        let pointer = match pointer {
            Some(p) => p,
            None => return,
        };

        #[cfg(any(test, debug_assertions))]
        crate::debug_allocation_map::mark_released(pointer.as_ptr() as usize);

        self.log.push(pointer);
        if self.log.len() >= LOG_CAPACITY {
            self.flush();
        }
    }

    /// Forces a drain of the pending log.
    pub fn scavenge(&mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        if self.log.is_empty() {
            return;
        }

        let mut heap = HEAP.lock().unwrap();
        for pointer in self.log.drain(..) {
            process_one(&mut heap, pointer);
        }
    }
}

fn process_one(heap: &mut Heap, pointer: NonNull<u8>) {
    let address = pointer.as_ptr() as usize;

    match heap.classify(address) {
        AddressKind::Small { chunk_index, page_index, line_index, size_class } => {
            heap.deallocate_small_line(chunk_index, page_index, line_index, size_class);
        }
        AddressKind::Medium { chunk_index, page_index, line_index, size_class } => {
            heap.deallocate_medium_line(chunk_index, page_index, line_index, size_class);
        }
        AddressKind::Large { chunk_index, begin } => {
            heap.deallocate_large(chunk_index, begin);
        }
        AddressKind::XLarge => {
            heap.deallocate_xlarge(address)
                .unwrap_or_else(|e| fatal!("deallocate_xlarge failed: {}", e));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deallocate_none_is_a_no_op() {
        let mut dealloc = Deallocator::new();
        dealloc.deallocate(None);
        dealloc.scavenge();
    }

    #[test]
    fn log_flushes_once_full() {
        let mut allocator = crate::allocator::Allocator::new();
        let mut dealloc = Deallocator::new();

        for _ in 0..(LOG_CAPACITY + 10) {
            let ptr = allocator.allocate(24);
            dealloc.deallocate(Some(ptr));
        }
        dealloc.scavenge();
        allocator.scavenge(&mut dealloc);
    }
}
