//! Tracks the live/dead status of every address this allocator has
//! handed out, so debug and test builds catch a double free or a
//! double allocation immediately instead of letting it corrupt the
//! heap silently.  Compiled only under `cfg(any(test, debug_assertions))`;
//! release builds pay nothing for it.
use std::collections::HashMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref LIVE: Mutex<HashMap<usize, bool>> = Default::default();
}

/// Marks `address` as returned to the mutator.  Aborts if it was
/// already live: that means the allocator handed out the same
/// address twice without an intervening free.
pub fn mark_allocated(address: usize) {
    let mut map = LIVE.lock().unwrap();
    let entry = map.entry(address).or_insert(false);
    if *entry {
        crate::error::fatal!("double allocation detected at {:#x}", address);
    }
    *entry = true;
}

/// Marks `address` as released by the mutator.  Aborts on a double
/// free: releasing an address that is not currently live.
pub fn mark_released(address: usize) {
    let mut map = LIVE.lock().unwrap();
    match map.get_mut(&address) {
        Some(entry) if *entry => *entry = false,
        _ => crate::error::fatal!("double free detected at {:#x}", address),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_then_release_is_fine() {
        mark_allocated(0xdead_beef);
        mark_released(0xdead_beef);
        mark_allocated(0xdead_beef);
        mark_released(0xdead_beef);
    }
}
