//! Thin wrapper over the OS's anonymous-mapping and physical-page-hint
//! primitives.  Every reservation is page-aligned; `reserve_aligned`
//! additionally guarantees power-of-two alignment by overallocating
//! and trimming, the same trick used by every bump-pointer VM
//! allocator in this family.
use crate::error::VmError;
use std::ffi::c_void;
use std::ptr::NonNull;

// Darwin exposes a reuse/reusable madvise pair that lets the kernel
// hand pages back to us without re-zeroing, which libc does not
// (yet) expose as named constants.
#[cfg(target_os = "macos")]
mod advice {
    pub const FREE_REUSABLE: libc::c_int = 7;
    pub const FREE_REUSE: libc::c_int = 8;
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// The platform's virtual memory page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[inline]
fn is_page_aligned(value: usize) -> bool {
    value % page_size() == 0
}

/// Rounds `value` down to the nearest page boundary.
#[inline]
pub fn round_down_to_page(value: usize) -> usize {
    value & !(page_size() - 1)
}

/// Rounds `value` up to the nearest page boundary.
#[inline]
pub fn round_up_to_page(value: usize) -> usize {
    let size = page_size();
    (value + size - 1) & !(size - 1)
}

/// Reserves a fresh, zero-filled anonymous mapping of exactly `size`
/// bytes.  `size` must already be a multiple of the page size.
pub fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
    debug_assert!(is_page_aligned(size));
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(VmError::new("mmap"));
        }

        Ok(NonNull::new_unchecked(ptr as *mut u8))
    }
}

/// Reserves a region of `size` bytes aligned to `alignment`, a power
/// of two and a multiple of the page size.  Overallocates by
/// `alignment` bytes and trims the unaligned head and tail back to
/// the OS.
pub fn reserve_aligned(size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
    debug_assert!(is_page_aligned(size));
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(is_page_aligned(alignment));

    if alignment <= page_size() {
        return reserve(size);
    }

    let padded_size = size.max(alignment) + alignment;
    let base = reserve(padded_size)?;
    let base_addr = base.as_ptr() as usize;

    let aligned_addr = (base_addr + alignment - 1) & !(alignment - 1);
    let head = aligned_addr - base_addr;
    let tail = padded_size - head - size;

    if head > 0 {
        release(base, head)?;
    }
    if tail > 0 {
        let tail_ptr = unsafe { NonNull::new_unchecked((aligned_addr + size) as *mut u8) };
        release(tail_ptr, tail)?;
    }

    Ok(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
}

/// Releases a region previously obtained from `reserve`/`reserve_aligned`.
pub fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
    debug_assert!(is_page_aligned(ptr.as_ptr() as usize));
    debug_assert!(is_page_aligned(size));

    if size == 0 {
        return Ok(());
    }

    let result = unsafe { libc::munmap(ptr.as_ptr() as *mut c_void, size) };
    if result != 0 {
        return Err(VmError::new("munmap"));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn madvise(ptr: NonNull<u8>, size: usize, advice: libc::c_int) -> Result<(), VmError> {
    let result = unsafe { libc::madvise(ptr.as_ptr() as *mut c_void, size, advice) };
    if result != 0 {
        return Err(VmError::new("madvise"));
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn madvise(ptr: NonNull<u8>, size: usize, advice: libc::c_int) -> Result<(), VmError> {
    let result = unsafe { libc::madvise(ptr.as_ptr() as *mut c_void, size, advice) };
    if result != 0 {
        return Err(VmError::new("madvise"));
    }
    Ok(())
}

/// Hints that the physical pages backing `[ptr, ptr+size)` are no
/// longer needed and may be reclaimed by the kernel.  `ptr` and `size`
/// must both be page-aligned.
pub fn hint_idle(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
    debug_assert!(is_page_aligned(ptr.as_ptr() as usize));
    debug_assert!(is_page_aligned(size));

    if size == 0 {
        return Ok(());
    }

    #[cfg(target_os = "macos")]
    {
        madvise(ptr, size, advice::FREE_REUSABLE)
    }
    #[cfg(not(target_os = "macos"))]
    {
        madvise(ptr, size, libc::MADV_DONTNEED)
    }
}

/// Hints that the physical pages backing `[ptr, ptr+size)` are needed
/// again and should be made resident.  `ptr` and `size` must both be
/// page-aligned.
pub fn hint_resident(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
    debug_assert!(is_page_aligned(ptr.as_ptr() as usize));
    debug_assert!(is_page_aligned(size));

    if size == 0 {
        return Ok(());
    }

    #[cfg(target_os = "macos")]
    {
        madvise(ptr, size, advice::FREE_REUSE)
    }
    #[cfg(not(target_os = "macos"))]
    {
        madvise(ptr, size, libc::MADV_WILLNEED)
    }
}

/// Like `hint_idle`, but rounds `[begin, begin+size)` inward to the
/// nearest fully-contained page-aligned subrange, so partially
/// covered edge pages are left alone.
pub fn hint_idle_sloppy(begin: usize, size: usize) -> Result<(), VmError> {
    let end = begin + size;
    let aligned_begin = round_up_to_page(begin);
    let aligned_end = round_down_to_page(end);

    if aligned_end <= aligned_begin {
        return Ok(());
    }

    let ptr = unsafe { NonNull::new_unchecked(aligned_begin as *mut u8) };
    hint_idle(ptr, aligned_end - aligned_begin)
}

/// Like `hint_resident`, but rounds `[begin, begin+size)` outward to
/// the smallest page-aligned superrange, so the caller's full range
/// is always covered.
pub fn hint_resident_sloppy(begin: usize, size: usize) -> Result<(), VmError> {
    let end = begin + size;
    let aligned_begin = round_down_to_page(begin);
    let aligned_end = round_up_to_page(end);

    let ptr = unsafe { NonNull::new_unchecked(aligned_begin as *mut u8) };
    hint_resident(ptr, aligned_end - aligned_begin)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn reserve_and_release_roundtrip() {
        let size = page_size() * 4;
        let ptr = reserve(size).expect("reservation should succeed");
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x42, size);
        }
        release(ptr, size).expect("release should succeed");
    }

    #[test]
    fn reserve_aligned_is_aligned() {
        let alignment = page_size() * 16;
        let size = alignment;
        let ptr = reserve_aligned(size, alignment).expect("reservation should succeed");
        assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        release(ptr, size).expect("release should succeed");
    }

    #[test]
    fn hints_do_not_error_on_fresh_mapping() {
        let size = page_size() * 2;
        let ptr = reserve(size).expect("reservation should succeed");
        hint_idle(ptr, size).expect("hint_idle should succeed");
        hint_resident(ptr, size).expect("hint_resident should succeed");
        release(ptr, size).expect("release should succeed");
    }
}
