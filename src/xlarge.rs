//! XLarge allocations bypass all structural sharing: each gets its
//! own VM reservation, tracked only so `deallocate`/`reallocate` can
//! recover its size.
use crate::error::VmError;
use crate::vm;
use std::collections::BTreeMap;
use std::ptr::NonNull;

#[derive(Default)]
pub struct XLargeRegistry {
    sizes: BTreeMap<usize, usize>,
}

impl XLargeRegistry {
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        let rounded = vm::round_up_to_page(size);
        let ptr = vm::reserve(rounded)?;
        self.sizes.insert(ptr.as_ptr() as usize, rounded);
        Ok(ptr)
    }

    pub fn allocate_aligned(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
        let rounded = vm::round_up_to_page(size);
        let ptr = vm::reserve_aligned(rounded, alignment)?;
        self.sizes.insert(ptr.as_ptr() as usize, rounded);
        Ok(ptr)
    }

    pub fn size_of(&self, address: usize) -> Option<usize> {
        self.sizes.get(&address).copied()
    }

    pub fn owns(&self, address: usize) -> bool {
        self.sizes.contains_key(&address)
    }

    pub fn deallocate(&mut self, address: usize) -> Result<(), VmError> {
        let size = match self.sizes.remove(&address) {
            Some(size) => size,
            None => crate::error::fatal!("xlarge deallocate: {:#x} is not an xlarge allocation", address),
        };
        vm::release(unsafe { NonNull::new_unchecked(address as *mut u8) }, size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_then_deallocate() {
        let mut registry = XLargeRegistry::default();
        let ptr = registry.allocate(10 * 1024 * 1024).expect("reservation should succeed");
        let address = ptr.as_ptr() as usize;
        assert!(registry.owns(address));
        assert!(registry.size_of(address).unwrap() >= 10 * 1024 * 1024);
        registry.deallocate(address).expect("release should succeed");
        assert!(!registry.owns(address));
    }
}
