//! A dedicated background thread that walks the heap's free pools and
//! returns idle physical pages to the OS, backing off whenever the
//! mutator has been minting fresh pages recently.
use crate::config;
use crate::heap::HEAP;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::thread;
use std::time::Duration;

static STARTED: Once = Once::new();
static RUNNING: AtomicBool = AtomicBool::new(true);

/// Starts the scavenger thread, once per process.  Idempotent: later
/// calls are no-ops.
pub fn ensure_started() {
    STARTED.call_once(|| {
        thread::Builder::new()
            .name("foundry-scavenger".into())
            .spawn(run)
            .expect("failed to spawn scavenger thread");
    });
}

fn run() {
    loop {
        if !RUNNING.load(Ordering::Relaxed) {
            return;
        }

        let made_progress = scavenge_pass();
        let sleep_duration = config::CONFIG.scavenge_sleep_duration;

        if !made_progress {
            thread::sleep(sleep_duration);
        }
    }
}

/// Runs one reclamation pass: small pages, then medium pages, then
/// large ranges, checking `is_allocating_pages` between every step so
/// a busy mutator always wins contention for fresh pages.
fn scavenge_pass() -> bool {
    let mut did_anything = false;

    loop {
        let mut heap = HEAP.lock().unwrap();
        if heap.take_and_reset_is_allocating_pages() {
            drop(heap);
            thread::sleep(config::CONFIG.scavenge_sleep_duration);
            continue;
        }

        let progressed = heap
            .scavenge_one_small_page()
            .unwrap_or_else(|e| crate::error::fatal!("scavenger: small page reclamation failed: {}", e));
        drop(heap);

        if !progressed {
            break;
        }
        did_anything = true;
    }

    loop {
        let mut heap = HEAP.lock().unwrap();
        if heap.take_and_reset_is_allocating_pages() {
            drop(heap);
            thread::sleep(config::CONFIG.scavenge_sleep_duration);
            continue;
        }

        let progressed = heap
            .scavenge_one_medium_page()
            .unwrap_or_else(|e| crate::error::fatal!("scavenger: medium page reclamation failed: {}", e));
        drop(heap);

        if !progressed {
            break;
        }
        did_anything = true;
    }

    loop {
        let mut heap = HEAP.lock().unwrap();
        if heap.take_and_reset_is_allocating_pages() {
            drop(heap);
            thread::sleep(config::CONFIG.scavenge_sleep_duration);
            continue;
        }

        let progressed = heap
            .scavenge_one_large_range()
            .unwrap_or_else(|e| crate::error::fatal!("scavenger: large range reclamation failed: {}", e));
        drop(heap);

        if !progressed {
            break;
        }
        did_anything = true;
    }

    did_anything
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ensure_started_is_idempotent() {
        ensure_started();
        ensure_started();
    }
}
