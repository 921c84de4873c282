//! Boundary-tag chunk heap walker
//!
//! Walks a contiguous heap region laid out the way libc malloc lays out an
//! arena: every chunk starts with two words, `prev_size` and `size | flags`.
//! Chunk sizes are multiples of 16 and at least 32. A chunk is in use when
//! the `PREV_INUSE` bit of the following chunk's size word is set. The chunk
//! that reaches the end of the region is the top chunk and is never an
//! allocation.
//!
//! ```text
//!  base                                                        limit
//!   │ prev │ size|P │ payload ...  │ prev │ size|P │ ... │ top ...│
//!   └──────── chunk 0 ─────────────┴──────── chunk 1 ───┴────────┘
//! ```
//!
//! Record sizes are the usable size `chunk_size - 8`: the next chunk's
//! `prev_size` word belongs to an in-use chunk's payload.

use super::source::{AllocationSource, ArenaDescriptor, Harvest, RawRecord, SourceError};
use crate::snapshot::{word_at, Snapshot, POINTER_SIZE};
use serde::Deserialize;
use tracing::debug;

const CHUNK_HEADER: u64 = 2 * POINTER_SIZE;
const MIN_CHUNK: u64 = 32;
const CHUNK_ALIGNMENT: u64 = 16;
const PREV_INUSE: u64 = 0x1;
const SIZE_BITS: u64 = !0x7;

/// A heap region to walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HeapRegion {
    pub base: u64,
    pub limit: u64,
    /// Allocator-recorded high-water mark, if known
    #[serde(default)]
    pub max_size: u64,
}

/// Source that walks one or more chunked heap regions
#[derive(Debug, Clone)]
pub struct ChunkHeapSource {
    name: String,
    regions: Vec<HeapRegion>,
}

impl ChunkHeapSource {
    pub fn new(name: impl Into<String>, regions: Vec<HeapRegion>) -> Self {
        Self {
            name: name.into(),
            regions,
        }
    }

    fn walk(
        snapshot: &dyn Snapshot,
        region: &HeapRegion,
        records: &mut Vec<RawRecord>,
    ) -> Result<ArenaDescriptor, SourceError> {
        let HeapRegion { base, limit, .. } = *region;
        if limit <= base || base % CHUNK_ALIGNMENT != 0 || limit - base < MIN_CHUNK {
            return Err(SourceError::InvalidRegion { base, limit });
        }
        let bytes = snapshot.read(base, limit - base)?;
        let len = limit - base;

        let mut chunk = 0u64;
        let mut top = 0u64;
        loop {
            let address = base + chunk;
            let size = word_at(bytes, (chunk + POINTER_SIZE) as usize)
                .ok_or_else(|| corrupt(address, "header runs past the heap limit"))?
                & SIZE_BITS;
            if size < MIN_CHUNK || size % CHUNK_ALIGNMENT != 0 {
                return Err(corrupt(address, &format!("invalid chunk size {:#x}", size)));
            }
            let next = match chunk.checked_add(size) {
                Some(next) if next <= len => next,
                _ => {
                    return Err(SourceError::Overrun {
                        address,
                        size,
                        limit,
                    })
                }
            };
            if next == len {
                top = size - CHUNK_HEADER;
                break;
            }
            let next_size = word_at(bytes, (next + POINTER_SIZE) as usize)
                .ok_or_else(|| corrupt(base + next, "header runs past the heap limit"))?;
            records.push(RawRecord {
                address: address + CHUNK_HEADER,
                size: size - POINTER_SIZE,
                used: next_size & PREV_INUSE != 0,
                arena: Some(base),
            });
            chunk = next;
        }

        Ok(ArenaDescriptor {
            address: base,
            limit,
            max_size: region.max_size,
            unallocated_bytes: top,
        })
    }
}

fn corrupt(address: u64, reason: &str) -> SourceError {
    SourceError::CorruptChunk {
        address,
        reason: reason.to_string(),
    }
}

impl AllocationSource for ChunkHeapSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self, snapshot: &dyn Snapshot) -> Result<Option<Harvest>, SourceError> {
        if self.regions.is_empty() {
            return Ok(None);
        }
        let mut harvest = Harvest::default();
        for region in &self.regions {
            let arena = Self::walk(snapshot, region, &mut harvest.records)?;
            debug!(
                source = %self.name,
                arena = %format!("{:#x}", arena.address),
                records = harvest.records.len(),
                "walked heap region"
            );
            harvest.arenas.push(arena);
        }
        Ok(Some(harvest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{MemoryImage, PermissionClass};

    const BASE: u64 = 0x10000;

    /// Lay out chunks `(size, used)` followed by a top chunk filling the region
    fn heap(chunks: &[(u64, bool)], region_len: u64) -> MemoryImage {
        let mut image = MemoryImage::new();
        image
            .map(BASE, vec![0; region_len as usize], PermissionClass::Writable)
            .unwrap();
        let mut offset = 0;
        let mut prev_used = true;
        for &(size, used) in chunks {
            image.write_word(BASE + offset + 8, size | u64::from(prev_used));
            prev_used = used;
            offset += size;
        }
        image.write_word(BASE + offset + 8, (region_len - offset) | u64::from(prev_used));
        image
    }

    fn region(len: u64) -> HeapRegion {
        HeapRegion {
            base: BASE,
            limit: BASE + len,
            max_size: 0,
        }
    }

    #[test]
    fn test_walk_used_and_free_chunks() {
        let image = heap(&[(0x20, true), (0x40, false), (0x30, true)], 0x100);
        let source = ChunkHeapSource::new("main", vec![region(0x100)]);
        let harvest = source.collect(&image).unwrap().unwrap();

        assert_eq!(harvest.records.len(), 3);
        assert_eq!(harvest.records[0].address, BASE + 0x10);
        assert_eq!(harvest.records[0].size, 0x18);
        assert!(harvest.records[0].used);
        assert!(!harvest.records[1].used);
        assert_eq!(harvest.records[1].size, 0x38);
        assert!(harvest.records[2].used);
        assert_eq!(harvest.arenas[0].unallocated_bytes, 0x100 - 0x90 - 0x10);
    }

    #[test]
    fn test_records_are_disjoint() {
        let image = heap(&[(0x20, true), (0x20, true), (0x20, true)], 0x80);
        let source = ChunkHeapSource::new("main", vec![region(0x80)]);
        let harvest = source.collect(&image).unwrap().unwrap();
        for pair in harvest.records.windows(2) {
            assert!(pair[0].address + pair[0].size <= pair[1].address);
        }
    }

    #[test]
    fn test_corrupt_size_is_error() {
        let mut image = heap(&[(0x20, true)], 0x80);
        image.write_word(BASE + 0x28, 0x13);
        let source = ChunkHeapSource::new("main", vec![region(0x80)]);
        assert!(matches!(
            source.collect(&image),
            Err(SourceError::CorruptChunk { address, .. }) if address == BASE + 0x20
        ));
    }

    #[test]
    fn test_overrun_is_error() {
        let mut image = heap(&[(0x20, true)], 0x80);
        image.write_word(BASE + 0x28, 0x1000 | 1);
        let source = ChunkHeapSource::new("main", vec![region(0x80)]);
        assert!(matches!(source.collect(&image), Err(SourceError::Overrun { .. })));
    }

    #[test]
    fn test_wrapping_size_is_error() {
        let mut image = heap(&[(0x20, true)], 0x80);
        image.write_word(BASE + 0x28, 0u64.wrapping_sub(0x20) | 1);
        let source = ChunkHeapSource::new("main", vec![region(0x80)]);
        assert!(matches!(
            source.collect(&image),
            Err(SourceError::Overrun { address, .. }) if address == BASE + 0x20
        ));
    }

    #[test]
    fn test_unmapped_region_is_error() {
        let image = MemoryImage::new();
        let source = ChunkHeapSource::new("main", vec![region(0x80)]);
        assert!(matches!(source.collect(&image), Err(SourceError::Snapshot(_))));
    }

    #[test]
    fn test_no_regions_is_absent() {
        let image = MemoryImage::new();
        let source = ChunkHeapSource::new("main", Vec::new());
        assert!(source.collect(&image).unwrap().is_none());
    }
}
