// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

/// Size of one allocator page.
///
/// Pages only partition the free-space index; blobs may span page boundaries.
pub const PAGE_SIZE: u64 = 100 * 1024 * 1024;

/// A free range inside one page. Sections in a page are sorted by offset and
/// never overlap or touch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FreeSection {
    pub offset: u64,
    pub size: u64,
}

/// Free-space allocator over the single backing file.
///
/// Tracks free sections per 100 MiB page plus the high-water mark
/// `next_offset`; bytes past `next_offset` have never been written.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlobAllocator {
    next_offset: u64,
    free_sections_by_page: BTreeMap<u64, Vec<FreeSection>>,
}

impl BlobAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a contiguous range, preferring freed space over growing the
    /// file.
    ///
    /// Walks pages in ascending order, first-fit over the sorted sections.
    /// A section ending on a page boundary counts as contiguous with a
    /// section starting the following page, so requests may be satisfied
    /// across page boundaries.
    pub fn register_blob(&mut self, size: u64) -> u64 {
        debug_assert!(size > 0);

        let mut run_start = 0u64;
        let mut run_len = 0u64;
        let mut run_end = 0u64;
        let mut found = None;

        'search: for sections in self.free_sections_by_page.values() {
            for section in sections {
                if run_len > 0 && run_end == section.offset {
                    run_len += section.size;
                } else {
                    run_start = section.offset;
                    run_len = section.size;
                }
                run_end = section.offset + section.size;

                if run_len >= size {
                    found = Some(run_start);
                    break 'search;
                }
            }
        }

        if let Some(offset) = found {
            self.take_range(offset, size);
            offset
        } else {
            let offset = self.next_offset;
            self.next_offset += size;
            offset
        }
    }

    /// Removes `[offset, offset + size)` from the free sections. The range
    /// must be covered by a contiguous run of free sections starting exactly
    /// at `offset`.
    fn take_range(&mut self, offset: u64, size: u64) {
        let mut pos = offset;
        let mut remaining = size;

        while remaining > 0 {
            let page = pos / PAGE_SIZE;

            let Some(sections) = self.free_sections_by_page.get_mut(&page) else {
                unreachable!("free run must cover the requested range");
            };

            let idx = sections.partition_point(|section| section.offset < pos);
            debug_assert!(
                idx < sections.len() && sections[idx].offset == pos,
                "free run must start on a section boundary"
            );

            let section = &mut sections[idx];
            if section.size <= remaining {
                remaining -= section.size;
                pos += section.size;
                sections.remove(idx);
            } else {
                section.offset += remaining;
                section.size -= remaining;
                remaining = 0;
            }

            if sections.is_empty() {
                self.free_sections_by_page.remove(&page);
            }
        }
    }

    /// Frees `[offset, offset + size)`, splitting the range by page and
    /// merging with adjacent free sections.
    ///
    /// Returns `false` (leaving the map untouched) if the range exceeds the
    /// high-water mark or overlaps an already-free section.
    #[must_use]
    pub fn unregister_blob(&mut self, offset: u64, size: u64) -> bool {
        if size == 0 || offset + size > self.next_offset {
            return false;
        }

        let start_page = offset / PAGE_SIZE;
        let end_page = (offset + size - 1) / PAGE_SIZE;

        // Validate every page before mutating any.
        for page in start_page..=end_page {
            let page_start = page * PAGE_SIZE;
            let range_start = offset.max(page_start);
            let range_end = (offset + size).min(page_start + PAGE_SIZE);

            if let Some(sections) = self.free_sections_by_page.get(&page) {
                let idx = sections.partition_point(|section| section.offset < range_start);

                if idx > 0 {
                    let prev = &sections[idx - 1];
                    if prev.offset + prev.size > range_start {
                        return false;
                    }
                }

                if idx < sections.len() && sections[idx].offset < range_end {
                    return false;
                }
            }
        }

        for page in start_page..=end_page {
            let page_start = page * PAGE_SIZE;
            let range_start = offset.max(page_start);
            let range_end = (offset + size).min(page_start + PAGE_SIZE);

            let sections = self.free_sections_by_page.entry(page).or_default();
            let idx = sections.partition_point(|section| section.offset < range_start);

            let merges_prev = idx > 0 && {
                let prev = &sections[idx - 1];
                prev.offset + prev.size == range_start
            };

            if merges_prev {
                sections[idx - 1].size += range_end - range_start;

                if idx < sections.len() {
                    let merged_end = sections[idx - 1].offset + sections[idx - 1].size;
                    if merged_end == sections[idx].offset {
                        sections[idx - 1].size += sections[idx].size;
                        sections.remove(idx);
                    }
                }
            } else if idx < sections.len() && sections[idx].offset == range_end {
                sections[idx].offset = range_start;
                sections[idx].size += range_end - range_start;
            } else {
                sections.insert(
                    idx,
                    FreeSection {
                        offset: range_start,
                        size: range_end - range_start,
                    },
                );
            }
        }

        if offset + size == self.next_offset {
            self.shrink_tail();
        }

        true
    }

    /// Drops trailing free sections and pulls `next_offset` back over them.
    fn shrink_tail(&mut self) {
        while let Some((&page, sections)) = self.free_sections_by_page.iter().next_back() {
            let Some(last) = sections.last() else {
                self.free_sections_by_page.remove(&page);
                continue;
            };

            if last.offset + last.size != self.next_offset {
                break;
            }

            self.next_offset = last.offset;

            let sections = self
                .free_sections_by_page
                .get_mut(&page)
                .unwrap_or_else(|| unreachable!());
            sections.pop();

            if sections.is_empty() {
                self.free_sections_by_page.remove(&page);
            }
        }
    }

    /// Logical file size (the high-water mark).
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.next_offset
    }

    /// Number of pages that contain at least one free section.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.free_sections_by_page.len()
    }

    /// Number of free sections, counting a run that continues across a page
    /// boundary as a single section.
    #[must_use]
    pub fn free_section_count(&self) -> usize {
        let mut count = 0;
        let mut prev_ends_on_boundary = false;
        let mut prev_page = None;

        for (&page, sections) in &self.free_sections_by_page {
            let page_start = page * PAGE_SIZE;

            let continues = prev_ends_on_boundary
                && prev_page == Some(page - 1)
                && sections
                    .first()
                    .is_some_and(|section| section.offset == page_start);

            count += sections.len();
            if continues {
                count -= 1;
            }

            prev_ends_on_boundary = sections
                .last()
                .is_some_and(|section| section.offset + section.size == page_start + PAGE_SIZE);
            prev_page = Some(page);
        }

        count
    }

    /// The `n`-th free section of the given page (test introspection).
    #[must_use]
    pub fn free_section(&self, page: u64, n: usize) -> Option<FreeSection> {
        self.free_sections_by_page
            .get(&page)
            .and_then(|sections| sections.get(n))
            .copied()
    }
}

impl Encode for BlobAllocator {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.next_offset)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.free_sections_by_page.len() as u32)?;

        for (page, sections) in &self.free_sections_by_page {
            writer.write_u64::<LittleEndian>(*page)?;

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<LittleEndian>(sections.len() as u32)?;

            for section in sections {
                writer.write_u64::<LittleEndian>(section.offset)?;
                writer.write_u64::<LittleEndian>(section.size)?;
            }
        }

        Ok(())
    }
}

impl Decode for BlobAllocator {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let next_offset = reader.read_u64::<LittleEndian>()?;
        let page_count = reader.read_u32::<LittleEndian>()?;

        let mut free_sections_by_page = BTreeMap::new();

        for _ in 0..page_count {
            let page = reader.read_u64::<LittleEndian>()?;
            let section_count = reader.read_u32::<LittleEndian>()?;

            let mut sections = Vec::with_capacity(section_count as usize);

            for _ in 0..section_count {
                let offset = reader.read_u64::<LittleEndian>()?;
                let size = reader.read_u64::<LittleEndian>()?;
                sections.push(FreeSection { offset, size });
            }

            free_sections_by_page.insert(page, sections);
        }

        Ok(Self {
            next_offset,
            free_sections_by_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{Decode, Encode};
    use test_log::test;

    #[test]
    fn register_single_blob() {
        let mut allocator = BlobAllocator::new();
        assert_eq!(allocator.register_blob(10), 0);
    }

    #[test]
    fn register_multiple_blobs() {
        let mut allocator = BlobAllocator::new();
        assert_eq!(allocator.register_blob(10), 0);
        assert_eq!(allocator.register_blob(20), 10);
        assert_eq!(allocator.file_size(), 30);
    }

    #[test]
    fn freed_space_is_reused() {
        let mut allocator = BlobAllocator::new();
        let a = allocator.register_blob(10);
        let _b = allocator.register_blob(20);

        assert!(allocator.unregister_blob(a, 10));
        assert_eq!(allocator.register_blob(5), 0);
    }

    #[test]
    fn merged_free_space_fits_larger_blob() {
        let mut allocator = BlobAllocator::new();
        let a = allocator.register_blob(10);
        let b = allocator.register_blob(20);
        let _c = allocator.register_blob(5);

        assert!(allocator.unregister_blob(a, 10));
        assert!(allocator.unregister_blob(b, 20));
        assert_eq!(allocator.free_section_count(), 1);
        assert_eq!(allocator.register_blob(25), 0);
    }

    #[test]
    fn too_large_request_appends_at_end() {
        let mut allocator = BlobAllocator::new();
        allocator.register_blob(10);
        allocator.register_blob(20);
        assert!(allocator.unregister_blob(0, 10));

        assert_eq!(allocator.register_blob(15), 30);
    }

    #[test]
    fn unregister_unknown_blob_fails() {
        let mut allocator = BlobAllocator::new();
        assert!(!allocator.unregister_blob(100, 10));
    }

    #[test]
    fn unregister_past_file_size_fails() {
        let mut allocator = BlobAllocator::new();
        assert_eq!(allocator.register_blob(50), 0);
        assert!(!allocator.unregister_blob(40, 20));
    }

    #[test]
    fn unregister_overlapping_free_section_fails() {
        let mut allocator = BlobAllocator::new();
        allocator.register_blob(10);
        allocator.register_blob(20);
        allocator.register_blob(30);
        assert!(allocator.unregister_blob(10, 20));

        let snapshot = allocator.clone();

        // starts inside the free section
        assert!(!allocator.unregister_blob(15, 10));
        // ends inside the free section
        assert!(!allocator.unregister_blob(5, 20));
        // fully inside
        assert!(!allocator.unregister_blob(12, 5));
        // spans across
        assert!(!allocator.unregister_blob(5, 30));

        assert_eq!(allocator, snapshot);
    }

    #[test]
    fn unregister_bridges_adjacent_free_sections() {
        let mut allocator = BlobAllocator::new();
        let a = allocator.register_blob(10);
        let b = allocator.register_blob(20);
        let c = allocator.register_blob(30);
        let _d = allocator.register_blob(40);

        assert!(allocator.unregister_blob(a, 10));
        assert!(allocator.unregister_blob(c, 30));
        assert_eq!(allocator.free_section_count(), 2);

        assert!(allocator.unregister_blob(b, 20));
        assert_eq!(allocator.free_section_count(), 1);
        assert_eq!(
            allocator.free_section(0, 0),
            Some(FreeSection { offset: 0, size: 60 })
        );
    }

    #[test]
    fn file_size_shrinks_when_tail_is_freed() {
        let mut allocator = BlobAllocator::new();
        let a = allocator.register_blob(10);
        let b = allocator.register_blob(20);
        assert_eq!(allocator.file_size(), 30);

        assert!(allocator.unregister_blob(b, 20));
        assert_eq!(allocator.file_size(), 10);

        assert!(allocator.unregister_blob(a, 10));
        assert_eq!(allocator.file_size(), 0);
        assert_eq!(allocator, BlobAllocator::new());
    }

    #[test]
    fn tail_shrink_walks_over_earlier_free_sections() {
        let mut allocator = BlobAllocator::new();
        let a = allocator.register_blob(10);
        let b = allocator.register_blob(20);
        let c = allocator.register_blob(30);

        assert!(allocator.unregister_blob(b, 20));
        // Freeing the tail merges with b's section and shrinks past both.
        assert!(allocator.unregister_blob(c, 30));
        assert_eq!(allocator.file_size(), 10);
        assert_eq!(allocator.free_section_count(), 0);

        assert!(allocator.unregister_blob(a, 10));
        assert_eq!(allocator, BlobAllocator::new());
    }

    #[test]
    fn blob_spanning_page_boundary_frees_into_two_pages() {
        let mut allocator = BlobAllocator::new();
        let filler = allocator.register_blob(PAGE_SIZE - 10);
        let spanning = allocator.register_blob(30);
        let _tail = allocator.register_blob(50);

        assert!(allocator.unregister_blob(spanning, 30));
        assert_eq!(allocator.page_count(), 2);
        // One logical run across the boundary
        assert_eq!(allocator.free_section_count(), 1);

        // The spanning run is found again by a fitting request.
        assert_eq!(allocator.register_blob(30), spanning);

        assert!(allocator.unregister_blob(filler, PAGE_SIZE - 10));
    }

    #[test]
    fn spanning_request_is_satisfied_across_pages() {
        let mut allocator = BlobAllocator::new();
        let a = allocator.register_blob(PAGE_SIZE - 10);
        let b = allocator.register_blob(40);
        let _guard = allocator.register_blob(10);

        assert!(allocator.unregister_blob(a, PAGE_SIZE - 10));
        assert!(allocator.unregister_blob(b, 40));

        // 100 MiB + 30 bytes of contiguous space at offset 0
        assert_eq!(allocator.register_blob(PAGE_SIZE + 20), 0);
    }

    #[test]
    fn serialize_roundtrip() {
        let mut allocator = BlobAllocator::new();
        allocator.register_blob(10);
        let b = allocator.register_blob(PAGE_SIZE);
        allocator.register_blob(77);
        assert!(allocator.unregister_blob(b, PAGE_SIZE));

        let bytes = allocator.encode_into_vec();
        let back = BlobAllocator::decode_from(&mut &bytes[..]).expect("decodes");

        assert_eq!(back, allocator);
        assert_eq!(back.encode_into_vec(), bytes);
    }

    #[test]
    fn register_unregister_pairs_restore_initial_state() {
        let initial = BlobAllocator::new().encode_into_vec();

        let mut allocator = BlobAllocator::new();
        let mut blobs = vec![];
        for size in [10u64, 200, 3000, 40, 500_000] {
            blobs.push((allocator.register_blob(size), size));
        }

        // free in mixed order
        for &(offset, size) in [&blobs[2], &blobs[0], &blobs[4], &blobs[1], &blobs[3]] {
            assert!(allocator.unregister_blob(offset, size));
        }

        assert_eq!(allocator.encode_into_vec(), initial);
    }
}
