//! Chunk/Page/Line bookkeeping for the Small and Medium regimes.
//!
//! A `Chunk` is a power-of-two-aligned VM reservation dedicated to one
//! regime.  It is carved into `Page`s, and each `Page` is carved into
//! `Line`s sized for the page's current size class.  Metadata lives in
//! an ordinary Rust allocation next to the chunk's data region rather
//! than embedded in the mapping itself: nothing here crosses an FFI
//! boundary, so there is no need to colocate it.
use crate::size_class;
use crate::vm;

pub const SMALL_LINE_SIZE: usize = 256;
pub const LINES_PER_SMALL_PAGE: usize = 64;
pub const SMALL_PAGE_SIZE: usize = SMALL_LINE_SIZE * LINES_PER_SMALL_PAGE;
pub const PAGES_PER_SMALL_CHUNK: usize = 64;
pub const SMALL_CHUNK_SIZE: usize = SMALL_PAGE_SIZE * PAGES_PER_SMALL_CHUNK;

pub const MEDIUM_LINE_SIZE: usize = 4096;
pub const LINES_PER_MEDIUM_PAGE: usize = 64;
pub const MEDIUM_PAGE_SIZE: usize = MEDIUM_LINE_SIZE * LINES_PER_MEDIUM_PAGE;
pub const PAGES_PER_MEDIUM_CHUNK: usize = 16;
pub const MEDIUM_CHUNK_SIZE: usize = MEDIUM_PAGE_SIZE * PAGES_PER_MEDIUM_CHUNK;

/// Precomputed per-line layout for one size class: where in the line
/// its first object starts, and how many whole objects fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineMetadata {
    pub start_offset: u32,
    pub object_count: u32,
}

/// Computes, for every line in a page of `line_size` bytes split into
/// `num_lines` lines, how many objects of `object_size` fit in that
/// line, accounting for objects that straddle the boundary from the
/// previous line.
///
/// The first line to hold any part of an object absorbs the leftover
/// space from the previous line's last (possibly partial) object: we
/// walk forward computing, for each line, how many whole objects
/// start within it.  The final line is never allowed to claim an
/// object that would run past the page, so its count is rounded down
/// instead of up.
fn compute_line_metadata(object_size: usize, line_size: usize, num_lines: usize) -> Vec<LineMetadata> {
    let mut table = vec![LineMetadata::default(); num_lines];
    let page_size = line_size * num_lines;

    let mut next_object_start: usize = 0;
    for (index, entry) in table.iter_mut().enumerate() {
        let line_begin = index * line_size;
        let line_end = line_begin + line_size;

        if next_object_start >= line_end {
            // This line is entirely consumed by an object that started earlier.
            *entry = LineMetadata { start_offset: 0, object_count: 0 };
            continue;
        }

        let start_offset = (next_object_start - line_begin) as u32;
        let available = line_end - next_object_start;

        let count = if index == num_lines - 1 {
            // Last line: round down, never let an object hang off the end of the page.
            (page_size - next_object_start) / object_size
        } else {
            // Every other line rounds up: an object may straddle into the next line,
            // which is accounted for by that line's `start_offset`.
            crate::util::div_round_up(available, object_size)
        };

        *entry = LineMetadata {
            start_offset,
            object_count: count as u32,
        };

        next_object_start += count * object_size;
    }

    table
}

lazy_static::lazy_static! {
    /// `SMALL_LINE_TABLES[class]` is the per-line layout for Small
    /// size class `class`.
    pub static ref SMALL_LINE_TABLES: Vec<Vec<LineMetadata>> = (0..size_class::NUM_SMALL_CLASSES)
        .map(|class| {
            let object_size = size_class::small_object_size(size_class::SmallSizeClass(class as u32));
            compute_line_metadata(object_size, SMALL_LINE_SIZE, LINES_PER_SMALL_PAGE)
        })
        .collect();

    /// `MEDIUM_LINE_TABLES[class]` is the per-line layout for Medium
    /// size class `class`.
    pub static ref MEDIUM_LINE_TABLES: Vec<Vec<LineMetadata>> = (0..size_class::NUM_MEDIUM_CLASSES)
        .map(|class| {
            let object_size = size_class::medium_object_size(size_class::MediumSizeClass(class as u32));
            compute_line_metadata(object_size, MEDIUM_LINE_SIZE, LINES_PER_MEDIUM_PAGE)
        })
        .collect();
}

/// The regime a `Chunk` serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Small,
    Medium,
}

impl ChunkKind {
    pub fn chunk_size(self) -> usize {
        match self {
            ChunkKind::Small => SMALL_CHUNK_SIZE,
            ChunkKind::Medium => MEDIUM_CHUNK_SIZE,
        }
    }

    pub fn page_size(self) -> usize {
        match self {
            ChunkKind::Small => SMALL_PAGE_SIZE,
            ChunkKind::Medium => MEDIUM_PAGE_SIZE,
        }
    }

    pub fn num_pages(self) -> usize {
        self.chunk_size() / self.page_size()
    }

    pub fn num_lines_per_page(self) -> usize {
        match self {
            ChunkKind::Small => LINES_PER_SMALL_PAGE,
            ChunkKind::Medium => LINES_PER_MEDIUM_PAGE,
        }
    }

    pub fn line_size(self) -> usize {
        match self {
            ChunkKind::Small => SMALL_LINE_SIZE,
            ChunkKind::Medium => MEDIUM_LINE_SIZE,
        }
    }
}

/// Per-line bookkeeping: how many live objects currently reference
/// this line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Line {
    pub ref_count: u32,
}

/// Per-page bookkeeping.  `size_class` is `None` for a page that is
/// not currently committed to any size class (i.e. sitting in a free
/// page pool).
#[derive(Debug)]
pub struct Page {
    pub size_class: Option<u32>,
    pub lines: Vec<Line>,
    /// Number of lines with a non-zero ref count; the page is fully
    /// free when this reaches zero.
    pub ref_count: u32,
    /// Whether this page's physical backing is currently resident.
    pub resident: bool,
}

impl Page {
    fn new(num_lines: usize) -> Self {
        Page {
            size_class: None,
            lines: vec![Line::default(); num_lines],
            ref_count: 0,
            resident: false,
        }
    }
}

/// A power-of-two-aligned VM reservation, carved into `Page`s.
pub struct Chunk {
    pub kind: ChunkKind,
    pub base: usize,
    pub pages: Vec<Page>,
}

impl Chunk {
    /// Reserves a fresh chunk of `kind` from the VM layer.
    pub fn reserve(kind: ChunkKind) -> Result<Self, crate::error::VmError> {
        let size = kind.chunk_size();
        let ptr = vm::reserve_aligned(size, size)?;
        let num_pages = kind.num_pages();
        let num_lines = kind.num_lines_per_page();
        let pages = (0..num_pages).map(|_| Page::new(num_lines)).collect();

        Ok(Chunk {
            kind,
            base: ptr.as_ptr() as usize,
            pages,
        })
    }

    pub fn page_address(&self, page_index: usize) -> usize {
        self.base + page_index * self.kind.page_size()
    }

    /// Returns the page index that owns `address`, if `address` falls
    /// within this chunk.
    pub fn page_index_for(&self, address: usize) -> Option<usize> {
        if address < self.base || address >= self.base + self.kind.chunk_size() {
            return None;
        }
        Some((address - self.base) / self.kind.page_size())
    }

}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // For any object size that fits at least once in a page, the line
    // table must account for every byte: no line's object run ever
    // starts before the previous line's last object ends, no object's
    // footprint extends past the page, and the table always offers at
    // least one whole object.
    proptest! {
        #[test]
        fn line_metadata_never_overruns_and_always_fits_something(
            object_size in 16usize..=4096,
            num_lines in 1usize..128,
        ) {
            let line_size = 256usize;
            let page_size = line_size * num_lines;
            prop_assume!(object_size <= page_size);

            let table = compute_line_metadata(object_size, line_size, num_lines);
            prop_assert_eq!(table.len(), num_lines);

            let total_objects: usize = table.iter().map(|l| l.object_count as usize).sum();
            prop_assert!(total_objects >= 1);
            prop_assert!(total_objects * object_size <= page_size);

            let last = table.last().unwrap();
            prop_assert!(last.start_offset as usize <= line_size);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_line_tables_cover_every_class() {
        assert_eq!(SMALL_LINE_TABLES.len(), size_class::NUM_SMALL_CLASSES);
        for (class, table) in SMALL_LINE_TABLES.iter().enumerate() {
            let object_size =
                size_class::small_object_size(size_class::SmallSizeClass(class as u32));
            let total_objects: u32 = table.iter().map(|l| l.object_count).sum();
            assert!(total_objects as usize * object_size <= SMALL_PAGE_SIZE);
            assert!(total_objects > 0);
        }
    }

    #[test]
    fn medium_line_tables_cover_every_class() {
        assert_eq!(MEDIUM_LINE_TABLES.len(), size_class::NUM_MEDIUM_CLASSES);
        for table in MEDIUM_LINE_TABLES.iter() {
            let total_objects: u32 = table.iter().map(|l| l.object_count).sum();
            assert!(total_objects > 0);
        }
    }

    #[test]
    fn last_line_never_overruns_page() {
        for table in SMALL_LINE_TABLES.iter() {
            let last = table.last().unwrap();
            assert!(last.start_offset as usize <= SMALL_LINE_SIZE);
        }
    }
}
