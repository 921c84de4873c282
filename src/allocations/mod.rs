//! Allocation indexing and classification storage
//!
//! - [`source`]: allocator walkers producing raw records
//! - [`Finder`]: the sorted, immutable allocation table
//! - [`TagHolder`]: write-once, one-byte-per-allocation classification

mod chunk_heap;
mod finder;
pub mod source;
mod tags;

pub use chunk_heap::{ChunkHeapSource, HeapRegion};
pub use finder::{AllocationRecord, ArenaStats, Finder, SourceId, SourceReport, SourceStatus};
pub use source::{
    AllocationSource, ArenaDescriptor, Harvest, RawRecord, RecordListSource, SourceError,
};
pub use tags::{TagHolder, TagIndex, MAX_TAGS};

/// Dense index of an allocation in address order (`0..count`)
pub type AllocationIndex = u32;
