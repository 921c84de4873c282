//! Producers of allocation records
//!
//! An [`AllocationSource`] walks one allocator's metadata in the snapshot and
//! hands the raw records (plus any arena descriptions) to the
//! [`Finder`](super::Finder). A source that finds no trace of its allocator
//! returns `Ok(None)`; a source whose metadata is present but inconsistent
//! returns an error and is reported as unavailable.

use crate::snapshot::{Snapshot, SnapshotError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by allocator metadata walkers
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("corrupt chunk header at {address:#x}: {reason}")]
    CorruptChunk { address: u64, reason: String },

    #[error("chunk at {address:#x} of size {size:#x} runs past the heap limit {limit:#x}")]
    Overrun { address: u64, size: u64, limit: u64 },

    #[error("invalid heap region [{base:#x}, {limit:#x})")]
    InvalidRegion { base: u64, limit: u64 },

    #[error("allocation at {0:#x} has zero size")]
    EmptyRecord(u64),

    #[error("allocation at {address:#x} of size {size:#x} wraps past the end of the address space")]
    WrapsAddressSpace { address: u64, size: u64 },

    #[error("allocations at {first:#x} and {second:#x} overlap")]
    Overlap { first: u64, second: u64 },

    #[error("allocator metadata unreadable: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// One allocation as reported by a source, before indexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub address: u64,
    pub size: u64,
    pub used: bool,
    /// Start address of the arena that owns the allocation, if any
    #[serde(default)]
    pub arena: Option<u64>,
}

/// An arena as seen by its source's metadata walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaDescriptor {
    pub address: u64,
    pub limit: u64,
    /// Historical high-water mark recorded by the allocator
    pub max_size: u64,
    /// Free bytes not carved into any chunk (top of the arena)
    pub unallocated_bytes: u64,
}

/// Everything a source produced for one snapshot
#[derive(Debug, Clone, Default)]
pub struct Harvest {
    pub records: Vec<RawRecord>,
    pub arenas: Vec<ArenaDescriptor>,
}

/// A walker for one allocator family
pub trait AllocationSource {
    fn name(&self) -> &str;

    /// Walk the allocator metadata once
    fn collect(&self, snapshot: &dyn Snapshot) -> Result<Option<Harvest>, SourceError>;
}

/// Records produced outside this crate by an external allocator finder
#[derive(Debug, Clone)]
pub struct RecordListSource {
    name: String,
    records: Vec<RawRecord>,
    arenas: Vec<ArenaDescriptor>,
}

impl RecordListSource {
    pub fn new(name: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            name: name.into(),
            records,
            arenas: Vec::new(),
        }
    }

    /// Attach an arena description to the records
    pub fn with_arena(mut self, arena: ArenaDescriptor) -> Self {
        self.arenas.push(arena);
        self
    }
}

impl AllocationSource for RecordListSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self, _snapshot: &dyn Snapshot) -> Result<Option<Harvest>, SourceError> {
        if self.records.is_empty() && self.arenas.is_empty() {
            return Ok(None);
        }
        Ok(Some(Harvest {
            records: self.records.clone(),
            arenas: self.arenas.clone(),
        }))
    }
}
