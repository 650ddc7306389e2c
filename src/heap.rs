//! The central heap: the single locked authority that mints fresh
//! bump ranges, pages, and large ranges for per-thread caches, and
//! reclaims them on free.  Every method here assumes the caller holds
//! `HEAP`'s mutex; there is no internal locking.
use crate::boundary_tag::LargeChunk;
use crate::bump::{BumpRange, BumpRangeCache};
use crate::chunk::{Chunk, ChunkKind, MEDIUM_LINE_TABLES, SMALL_LINE_TABLES};
use crate::error::{fatal, HeapError};
use crate::free_range::{FreeRangeSet, RangeId};
use crate::size_class::{self, MediumSizeClass, SmallSizeClass};
use crate::vm;
use crate::xlarge::XLargeRegistry;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Large ranges are carved out of chunks this big, aligned the same
/// way Small/Medium chunks are, so an address can be classified by
/// masking down to a chunk base.
pub const LARGE_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// What kind of object an address belongs to, as determined purely by
/// which chunk (if any) contains it.  The closed set of possibilities
/// mirrors the four-regime taxonomy; dispatch on this enum replaces
/// any form of virtual call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Small { chunk_index: usize, page_index: usize, line_index: usize, size_class: u32 },
    Medium { chunk_index: usize, page_index: usize, line_index: usize, size_class: u32 },
    Large { chunk_index: usize, begin: usize },
    XLarge,
}

#[derive(Clone, Copy)]
struct PageRef {
    chunk_index: usize,
    page_index: usize,
}

pub struct Heap {
    small_chunks: Vec<Chunk>,
    medium_chunks: Vec<Chunk>,
    small_chunk_bases: BTreeMap<usize, usize>,
    medium_chunk_bases: BTreeMap<usize, usize>,

    pages_with_free_lines_small: Vec<Vec<PageRef>>,
    pages_with_free_lines_medium: Vec<Vec<PageRef>>,
    free_small_pages: Vec<PageRef>,
    free_medium_pages: Vec<PageRef>,

    large_chunks: Vec<LargeChunk>,
    large_chunk_bases: BTreeMap<usize, usize>,
    free_ranges: FreeRangeSet,

    xlarge: XLargeRegistry,

    pub(crate) is_allocating_pages: bool,
}

impl Heap {
    fn new() -> Self {
        Heap {
            small_chunks: Vec::new(),
            medium_chunks: Vec::new(),
            small_chunk_bases: BTreeMap::new(),
            medium_chunk_bases: BTreeMap::new(),
            pages_with_free_lines_small: (0..size_class::NUM_SMALL_CLASSES).map(|_| Vec::new()).collect(),
            pages_with_free_lines_medium: (0..size_class::NUM_MEDIUM_CLASSES).map(|_| Vec::new()).collect(),
            free_small_pages: Vec::new(),
            free_medium_pages: Vec::new(),
            large_chunks: Vec::new(),
            large_chunk_bases: BTreeMap::new(),
            free_ranges: FreeRangeSet::default(),
            xlarge: XLargeRegistry::default(),
            is_allocating_pages: false,
        }
    }

    /// Classifies `address` by which chunk, if any, contains it.
    pub fn classify(&self, address: usize) -> AddressKind {
        if let Some((&base, &index)) = self.small_chunk_bases.range(..=address).next_back() {
            if address < base + ChunkKind::Small.chunk_size() {
                let chunk = &self.small_chunks[index];
                let page_index = chunk.page_index_for(address).unwrap();
                let line_index = (address - chunk.page_address(page_index)) / ChunkKind::Small.line_size();
                let size_class = chunk.pages[page_index]
                    .size_class
                    .unwrap_or_else(|| fatal!("classify: small page at {:#x} has no size class", address));
                return AddressKind::Small { chunk_index: index, page_index, line_index, size_class };
            }
        }

        if let Some((&base, &index)) = self.medium_chunk_bases.range(..=address).next_back() {
            if address < base + ChunkKind::Medium.chunk_size() {
                let chunk = &self.medium_chunks[index];
                let page_index = chunk.page_index_for(address).unwrap();
                let line_index = (address - chunk.page_address(page_index)) / ChunkKind::Medium.line_size();
                let size_class = chunk.pages[page_index]
                    .size_class
                    .unwrap_or_else(|| fatal!("classify: medium page at {:#x} has no size class", address));
                return AddressKind::Medium { chunk_index: index, page_index, line_index, size_class };
            }
        }

        if let Some((_, &index)) = self.large_chunk_bases.range(..=address).next_back() {
            let chunk = &self.large_chunks[index];
            if address < chunk.end() {
                // `address` is always the exact start of the range the
                // caller was handed by `allocate_large`/`allocate`, not
                // an arbitrary interior byte, so it is itself the key
                // into the chunk's boundary-tag map.
                return AddressKind::Large { chunk_index: index, begin: address };
            }
        }

        AddressKind::XLarge
    }

    // ---- Small/Medium page and line refill (§4.5.1) ----

    fn allocate_small_page(&mut self, size_class: SmallSizeClass) -> Result<PageRef, HeapError> {
        while let Some(candidate) = self.pages_with_free_lines_small[size_class.0 as usize].pop() {
            let page = &self.small_chunks[candidate.chunk_index].pages[candidate.page_index];
            if page.ref_count > 0 && page.size_class == Some(size_class.0) {
                return Ok(candidate);
            }
            // Stale entry: refcount hit zero (page moved to the free pool)
            // or the page was reassigned to a different class since.
        }

        if let Some(candidate) = self.free_small_pages.pop() {
            self.commit_page(candidate.chunk_index, candidate.page_index, ChunkKind::Small, size_class.0)?;
            return Ok(candidate);
        }

        let chunk_index = self.reserve_small_chunk()?;
        let page_ref = PageRef { chunk_index, page_index: 0 };
        self.commit_page(chunk_index, 0, ChunkKind::Small, size_class.0)?;
        Ok(page_ref)
    }

    fn allocate_medium_page(&mut self, size_class: MediumSizeClass) -> Result<PageRef, HeapError> {
        while let Some(candidate) = self.pages_with_free_lines_medium[size_class.0 as usize].pop() {
            let page = &self.medium_chunks[candidate.chunk_index].pages[candidate.page_index];
            if page.ref_count > 0 && page.size_class == Some(size_class.0) {
                return Ok(candidate);
            }
        }

        if let Some(candidate) = self.free_medium_pages.pop() {
            self.commit_page(candidate.chunk_index, candidate.page_index, ChunkKind::Medium, size_class.0)?;
            return Ok(candidate);
        }

        let chunk_index = self.reserve_medium_chunk()?;
        let page_ref = PageRef { chunk_index, page_index: 0 };
        self.commit_page(chunk_index, 0, ChunkKind::Medium, size_class.0)?;
        Ok(page_ref)
    }

    fn commit_page(&mut self, chunk_index: usize, page_index: usize, kind: ChunkKind, size_class: u32) -> Result<(), HeapError> {
        let chunk = match kind {
            ChunkKind::Small => &mut self.small_chunks[chunk_index],
            ChunkKind::Medium => &mut self.medium_chunks[chunk_index],
        };
        let page = &mut chunk.pages[page_index];

        if !page.resident {
            let address = chunk.page_address(page_index);
            let ptr = unsafe { NonNull::new_unchecked(address as *mut u8) };
            vm::hint_resident(ptr, kind.page_size())?;
            page.resident = true;
        }

        page.size_class = Some(size_class);
        for line in page.lines.iter_mut() {
            line.ref_count = 0;
        }
        page.ref_count = 0;
        self.is_allocating_pages = true;
        Ok(())
    }

    fn reserve_small_chunk(&mut self) -> Result<usize, HeapError> {
        let chunk = Chunk::reserve(ChunkKind::Small)?;
        let base = chunk.base;
        let index = self.small_chunks.len();
        self.small_chunks.push(chunk);
        self.small_chunk_bases.insert(base, index);

        // Every page past the first becomes immediately available.
        for page_index in 1..ChunkKind::Small.num_pages() {
            self.free_small_pages.push(PageRef { chunk_index: index, page_index });
        }
        Ok(index)
    }

    fn reserve_medium_chunk(&mut self) -> Result<usize, HeapError> {
        let chunk = Chunk::reserve(ChunkKind::Medium)?;
        let base = chunk.base;
        let index = self.medium_chunks.len();
        self.medium_chunks.push(chunk);
        self.medium_chunk_bases.insert(base, index);

        for page_index in 1..ChunkKind::Medium.num_pages() {
            self.free_medium_pages.push(PageRef { chunk_index: index, page_index });
        }
        Ok(index)
    }

    /// Refills `cache` with bump ranges for `size_class`, per the
    /// line-run-merging algorithm: skip a trailing zero-capacity
    /// line, merge consecutive free lines into one range, and mark
    /// each line referenced by its full object count so a later
    /// single-object free only clears the line once every object in
    /// it has been freed.
    pub fn refill_small_bump_range_cache(
        &mut self,
        size_class: SmallSizeClass,
        cache: &mut BumpRangeCache,
    ) -> Result<(), HeapError> {
        let table = &SMALL_LINE_TABLES[size_class.0 as usize];

        while cache.has_room() {
            let page_ref = self.allocate_small_page(size_class)?;
            let chunk = &mut self.small_chunks[page_ref.chunk_index];
            let page_address = chunk.page_address(page_ref.page_index);
            let page = &mut chunk.pages[page_ref.page_index];

            let num_lines = page.lines.len();
            let mut index = 0usize;
            while index < num_lines {
                if index == num_lines - 1 && table[index].object_count == 0 {
                    break;
                }
                if page.lines[index].ref_count > 0 {
                    index += 1;
                    continue;
                }

                let run_start = index;
                let mut total_objects = 0u32;
                while index < num_lines
                    && page.lines[index].ref_count == 0
                    && !(index == num_lines - 1 && table[index].object_count == 0)
                {
                    total_objects += table[index].object_count;
                    index += 1;
                }

                if total_objects == 0 {
                    continue;
                }

                for (offset, line) in page.lines[run_start..index].iter_mut().enumerate() {
                    line.ref_count = table[run_start + offset].object_count;
                }
                page.ref_count += (index - run_start) as u32;

                let begin = page_address + run_start * ChunkKind::Small.line_size() + table[run_start].start_offset as usize;
                cache.push(BumpRange { begin, object_count: total_objects });
            }

            if page.ref_count as usize == num_lines {
                // Fully claimed; nothing more to offer a future refill
                // until lines are freed back.
            } else {
                self.pages_with_free_lines_small[size_class.0 as usize].push(page_ref);
            }
        }
        Ok(())
    }

    pub fn refill_medium_bump_range_cache(
        &mut self,
        size_class: MediumSizeClass,
        cache: &mut BumpRangeCache,
    ) -> Result<(), HeapError> {
        let table = &MEDIUM_LINE_TABLES[size_class.0 as usize];

        while cache.has_room() {
            let page_ref = self.allocate_medium_page(size_class)?;
            let chunk = &mut self.medium_chunks[page_ref.chunk_index];
            let page_address = chunk.page_address(page_ref.page_index);
            let page = &mut chunk.pages[page_ref.page_index];

            let num_lines = page.lines.len();
            let mut index = 0usize;
            while index < num_lines {
                if index == num_lines - 1 && table[index].object_count == 0 {
                    break;
                }
                if page.lines[index].ref_count > 0 {
                    index += 1;
                    continue;
                }

                let run_start = index;
                let mut total_objects = 0u32;
                while index < num_lines
                    && page.lines[index].ref_count == 0
                    && !(index == num_lines - 1 && table[index].object_count == 0)
                {
                    total_objects += table[index].object_count;
                    index += 1;
                }

                if total_objects == 0 {
                    continue;
                }

                for (offset, line) in page.lines[run_start..index].iter_mut().enumerate() {
                    line.ref_count = table[run_start + offset].object_count;
                }
                page.ref_count += (index - run_start) as u32;

                let begin = page_address + run_start * ChunkKind::Medium.line_size() + table[run_start].start_offset as usize;
                cache.push(BumpRange { begin, object_count: total_objects });
            }

            if page.ref_count as usize != num_lines {
                self.pages_with_free_lines_medium[size_class.0 as usize].push(page_ref);
            }
        }
        Ok(())
    }

    // ---- Small/Medium line deallocation (§4.5.3) ----

    pub fn deallocate_small_line(&mut self, chunk_index: usize, page_index: usize, line_index: usize, size_class: u32) {
        let chunk = &mut self.small_chunks[chunk_index];
        let page = &mut chunk.pages[page_index];
        debug_assert_eq!(page.size_class, Some(size_class));

        let line = &mut page.lines[line_index];
        debug_assert!(line.ref_count > 0, "deallocating from an already-free line");
        line.ref_count -= 1;
        if line.ref_count > 0 {
            // Other live objects remain in this line; the line itself
            // is not free yet.
            return;
        }

        let was_first_free = page.ref_count as usize == page.lines.len();
        page.ref_count -= 1;

        if was_first_free {
            self.pages_with_free_lines_small[size_class as usize].push(PageRef { chunk_index, page_index });
        }

        if page.ref_count == 0 {
            self.free_small_pages.push(PageRef { chunk_index, page_index });
        }
    }

    pub fn deallocate_medium_line(&mut self, chunk_index: usize, page_index: usize, line_index: usize, size_class: u32) {
        let chunk = &mut self.medium_chunks[chunk_index];
        let page = &mut chunk.pages[page_index];
        debug_assert_eq!(page.size_class, Some(size_class));

        let line = &mut page.lines[line_index];
        debug_assert!(line.ref_count > 0, "deallocating from an already-free line");
        line.ref_count -= 1;
        if line.ref_count > 0 {
            return;
        }

        let was_first_free = page.ref_count as usize == page.lines.len();
        page.ref_count -= 1;

        if was_first_free {
            self.pages_with_free_lines_medium[size_class as usize].push(PageRef { chunk_index, page_index });
        }

        if page.ref_count == 0 {
            self.free_medium_pages.push(PageRef { chunk_index, page_index });
        }
    }

    /// The live size of the object occupying `address`, looked up via
    /// the same classification `deallocate`/`reallocate` use.
    pub fn object_size_of(&self, address: usize) -> usize {
        match self.classify(address) {
            AddressKind::Small { size_class, .. } => size_class::small_object_size(SmallSizeClass(size_class)),
            AddressKind::Medium { size_class, .. } => size_class::medium_object_size(MediumSizeClass(size_class)),
            AddressKind::Large { chunk_index, begin } => self.large_range_size(chunk_index, begin),
            AddressKind::XLarge => self
                .xlarge_size(address)
                .unwrap_or_else(|| fatal!("object_size_of: {:#x} is not a known allocation", address)),
        }
    }

    // ---- Large (§4.5.4) ----

    fn reserve_large_chunk(&mut self, min_size: usize) -> Result<usize, HeapError> {
        let size = vm::round_up_to_page(min_size.max(LARGE_CHUNK_SIZE));
        let ptr = vm::reserve_aligned(size, crate::size_class::LARGE_ALIGNMENT)?;
        let base = ptr.as_ptr() as usize;
        let index = self.large_chunks.len();
        self.large_chunks.push(LargeChunk::new(base, size));
        self.large_chunk_bases.insert(base, index);
        self.free_ranges.insert(RangeId { chunk_index: index, begin: base }, size);
        Ok(index)
    }

    pub fn allocate_large(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let size = size_class::round_up_to_large_alignment(size);

        let (id, _found_size) = match self.free_ranges.take(size) {
            Some(hit) => hit,
            None => {
                let chunk_index = self.reserve_large_chunk(size)?;
                self.free_ranges
                    .take(size)
                    .unwrap_or_else(|| fatal!("large chunk reservation did not yield a usable free range"))
            }
        };

        let chunk = &mut self.large_chunks[id.chunk_index];
        let (has_physical_pages, leftover) = chunk.allocate(id.begin, size);

        if let Some((leftover_begin, leftover_size)) = leftover {
            self.free_ranges.insert(RangeId { chunk_index: id.chunk_index, begin: leftover_begin }, leftover_size);
        }

        if !has_physical_pages {
            vm::hint_resident_sloppy(id.begin, size)?;
        }

        self.is_allocating_pages = true;
        Ok(unsafe { NonNull::new_unchecked(id.begin as *mut u8) })
    }

    pub fn deallocate_large(&mut self, chunk_index: usize, begin: usize) {
        let chunk = &mut self.large_chunks[chunk_index];
        let (coalesced_begin, coalesced_size) = chunk.deallocate(begin);
        self.free_ranges.insert(RangeId { chunk_index, begin: coalesced_begin }, coalesced_size);
    }

    pub fn large_range_size(&self, chunk_index: usize, begin: usize) -> usize {
        self.large_chunks[chunk_index]
            .tag_at(begin)
            .unwrap_or_else(|| fatal!("large_range_size: no tag at {:#x}", begin))
            .size
    }

    // ---- XLarge (§4.5.5) ----

    pub fn allocate_xlarge(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        Ok(self.xlarge.allocate(size)?)
    }

    pub fn allocate_xlarge_aligned(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        Ok(self.xlarge.allocate_aligned(size, alignment)?)
    }

    pub fn deallocate_xlarge(&mut self, address: usize) -> Result<(), HeapError> {
        Ok(self.xlarge.deallocate(address)?)
    }

    pub fn xlarge_size(&self, address: usize) -> Option<usize> {
        self.xlarge.size_of(address)
    }

    // ---- Scavenger (§4.5.6) ----

    /// Releases the physical backing of one fully-free small page, if
    /// any remain.  Returns whether work was done, so the scavenger
    /// knows whether to keep looping.
    pub fn scavenge_one_small_page(&mut self) -> Result<bool, HeapError> {
        let page_ref = match self.free_small_pages.pop() {
            Some(p) => p,
            None => return Ok(false),
        };
        let chunk = &mut self.small_chunks[page_ref.chunk_index];
        let address = chunk.page_address(page_ref.page_index);
        let page = &mut chunk.pages[page_ref.page_index];
        if page.resident {
            let ptr = unsafe { NonNull::new_unchecked(address as *mut u8) };
            vm::hint_idle(ptr, ChunkKind::Small.page_size())?;
            page.resident = false;
        }
        Ok(true)
    }

    pub fn scavenge_one_medium_page(&mut self) -> Result<bool, HeapError> {
        let page_ref = match self.free_medium_pages.pop() {
            Some(p) => p,
            None => return Ok(false),
        };
        let chunk = &mut self.medium_chunks[page_ref.chunk_index];
        let address = chunk.page_address(page_ref.page_index);
        let page = &mut chunk.pages[page_ref.page_index];
        if page.resident {
            let ptr = unsafe { NonNull::new_unchecked(address as *mut u8) };
            vm::hint_idle(ptr, ChunkKind::Medium.page_size())?;
            page.resident = false;
        }
        Ok(true)
    }

    /// Releases the physical backing of one free Large range that
    /// still has resident pages, largest first, rounded inward to
    /// whole VM pages.  Ranges already idle are put back and skipped
    /// rather than returned again, so repeated calls drain every
    /// idle-eligible range instead of only ever inspecting the single
    /// largest one.
    pub fn scavenge_one_large_range(&mut self) -> Result<bool, HeapError> {
        let mut already_idle = Vec::new();

        let result = loop {
            let (id, size) = match self.free_ranges.take_largest() {
                Some(hit) => hit,
                None => break Ok(false),
            };

            let has_physical_pages = self.large_chunks[id.chunk_index]
                .tag_at(id.begin)
                .map(|t| t.has_physical_pages)
                .unwrap_or(false);

            if !has_physical_pages {
                already_idle.push((id, size));
                continue;
            }

            break vm::hint_idle_sloppy(id.begin, size)
                .map(|()| {
                    self.large_chunks[id.chunk_index].mark_pages_idle(id.begin);
                    self.free_ranges.insert(id, size);
                    true
                })
                .map_err(HeapError::from);
        };

        for (id, size) in already_idle {
            self.free_ranges.insert(id, size);
        }
        result
    }

    pub fn take_and_reset_is_allocating_pages(&mut self) -> bool {
        std::mem::replace(&mut self.is_allocating_pages, false)
    }
}

lazy_static::lazy_static! {
    pub static ref HEAP: Mutex<Heap> = Mutex::new(Heap::new());
}
