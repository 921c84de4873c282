//! Sorted allocation table
//!
//! The [`Finder`] merges the records of every available
//! [`AllocationSource`] into one table sorted by address and assigns each
//! record a dense [`AllocationIndex`]. The table is immutable once built.
//!
//! # Failure policy
//!
//! - A source whose metadata is inconsistent (walker error, zero-size records,
//!   records overlapping each other) is reported as unavailable and
//!   contributes nothing; the other sources continue.
//! - A source whose records overlap a source accepted earlier is unavailable.
//! - When no source is available the finder is disabled: zero allocations,
//!   not an error.

use super::source::{AllocationSource, ArenaDescriptor, RawRecord, SourceError};
use super::AllocationIndex;
use crate::snapshot::Snapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Identifies the source that produced a record (registration order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceId(pub u16);

/// One heap allocation found in the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub index: AllocationIndex,
    pub address: u64,
    pub size: u64,
    pub used: bool,
    pub source: SourceId,
    /// Start address of the owning arena, if the source tracks arenas
    pub arena: Option<u64>,
}

impl AllocationRecord {
    /// First address past the allocation; indexed records never wrap
    pub fn limit(&self) -> u64 {
        self.address + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        self.address <= address && address < self.limit()
    }
}

/// Per-arena accounting, computed once while indexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    pub address: u64,
    pub limit: u64,
    /// Current footprint: `used_bytes + free_bytes`
    pub size: u64,
    /// Largest size the arena is known to have reached
    pub max_size: u64,
    pub used_count: usize,
    pub used_bytes: u64,
    pub free_count: usize,
    /// Free allocations plus bytes never carved into allocations
    pub free_bytes: u64,
}

/// Outcome of one source during indexing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SourceStatus {
    Available { records: usize },
    /// The allocator was not found in the snapshot
    Absent,
    /// The allocator was found but its metadata could not be trusted
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub id: SourceId,
    pub name: String,
    pub status: SourceStatus,
}

impl fmt::Display for SourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            SourceStatus::Available { records } => {
                write!(f, "{}: available ({} allocations)", self.name, records)
            }
            SourceStatus::Absent => write!(f, "{}: not present", self.name),
            SourceStatus::Unavailable { reason } => {
                write!(f, "{}: unavailable ({})", self.name, reason)
            }
        }
    }
}

/// Index of all allocations in the snapshot
#[derive(Debug, Default)]
pub struct Finder {
    records: Vec<AllocationRecord>,
    reports: Vec<SourceReport>,
    arenas: BTreeMap<u64, ArenaStats>,
}

impl Finder {
    /// Run every source once and index the surviving records
    pub fn build(snapshot: &dyn Snapshot, sources: &[Box<dyn AllocationSource>]) -> Self {
        let mut accepted: Vec<(SourceId, RawRecord)> = Vec::new();
        let mut descriptors: Vec<ArenaDescriptor> = Vec::new();
        let mut reports = Vec::with_capacity(sources.len());

        for (i, source) in sources.iter().enumerate() {
            let id = SourceId(i as u16);
            let status = match source.collect(snapshot) {
                Ok(None) => SourceStatus::Absent,
                Ok(Some(harvest)) => {
                    let mut records = harvest.records;
                    match Self::validate(&mut records, &accepted) {
                        Ok(()) => {
                            let count = records.len();
                            accepted.extend(records.into_iter().map(|r| (id, r)));
                            accepted.sort_unstable_by_key(|(_, r)| r.address);
                            descriptors.extend(harvest.arenas);
                            SourceStatus::Available { records: count }
                        }
                        Err(e) => SourceStatus::Unavailable {
                            reason: e.to_string(),
                        },
                    }
                }
                Err(e) => SourceStatus::Unavailable {
                    reason: e.to_string(),
                },
            };
            if let SourceStatus::Unavailable { reason } = &status {
                warn!(source = source.name(), %reason, "allocation source disabled");
            }
            reports.push(SourceReport {
                id,
                name: source.name().to_string(),
                status,
            });
        }

        let records: Vec<AllocationRecord> = accepted
            .into_iter()
            .enumerate()
            .map(|(index, (source, raw))| AllocationRecord {
                index: index as AllocationIndex,
                address: raw.address,
                size: raw.size,
                used: raw.used,
                source,
                arena: raw.arena,
            })
            .collect();

        let arenas = Self::tally_arenas(&records, &descriptors);
        debug!(
            allocations = records.len(),
            arenas = arenas.len(),
            "allocation index built"
        );
        Self {
            records,
            reports,
            arenas,
        }
    }

    /// Sort a source's records and check them against themselves and the
    /// records already accepted
    fn validate(
        records: &mut [RawRecord],
        accepted: &[(SourceId, RawRecord)],
    ) -> Result<(), SourceError> {
        records.sort_unstable_by_key(|r| r.address);
        for record in records.iter() {
            if record.size == 0 {
                return Err(SourceError::EmptyRecord(record.address));
            }
            if record.address.checked_add(record.size).is_none() {
                return Err(SourceError::WrapsAddressSpace {
                    address: record.address,
                    size: record.size,
                });
            }
        }
        for pair in records.windows(2) {
            if pair[0].address + pair[0].size > pair[1].address {
                return Err(SourceError::Overlap {
                    first: pair[0].address,
                    second: pair[1].address,
                });
            }
        }
        for record in records.iter() {
            let idx = accepted.partition_point(|(_, r)| r.address < record.address + record.size);
            if idx > 0 {
                let (_, prior) = accepted[idx - 1];
                if prior.address + prior.size > record.address {
                    return Err(SourceError::Overlap {
                        first: prior.address,
                        second: record.address,
                    });
                }
            }
        }
        Ok(())
    }

    fn tally_arenas(
        records: &[AllocationRecord],
        descriptors: &[ArenaDescriptor],
    ) -> BTreeMap<u64, ArenaStats> {
        let mut arenas: BTreeMap<u64, ArenaStats> = descriptors
            .iter()
            .map(|d| {
                (
                    d.address,
                    ArenaStats {
                        address: d.address,
                        limit: d.limit,
                        size: 0,
                        max_size: d.max_size,
                        used_count: 0,
                        used_bytes: 0,
                        free_count: 0,
                        free_bytes: d.unallocated_bytes,
                    },
                )
            })
            .collect();

        for record in records {
            let Some(stats) = record.arena.and_then(|a| arenas.get_mut(&a)) else {
                continue;
            };
            if record.used {
                stats.used_count += 1;
                stats.used_bytes += record.size;
            } else {
                stats.free_count += 1;
                stats.free_bytes += record.size;
            }
        }
        for stats in arenas.values_mut() {
            stats.size = stats.used_bytes + stats.free_bytes;
            stats.max_size = stats.max_size.max(stats.size);
        }
        arenas
    }

    /// True when no allocator was recognized; queries see zero allocations
    pub fn is_disabled(&self) -> bool {
        !self
            .reports
            .iter()
            .any(|r| matches!(r.status, SourceStatus::Available { .. }))
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// # Panics
    /// Panics if `index` is out of range.
    pub fn record_at(&self, index: AllocationIndex) -> &AllocationRecord {
        match self.records.get(index as usize) {
            Some(record) => record,
            None => panic!(
                "Invalid allocation index {} (allocation count {})",
                index,
                self.records.len()
            ),
        }
    }

    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    /// Index of the allocation starting exactly at `address`
    pub fn lookup_exact(&self, address: u64) -> Option<AllocationIndex> {
        self.records
            .binary_search_by_key(&address, |r| r.address)
            .ok()
            .map(|i| i as AllocationIndex)
    }

    /// Index of the allocation whose `[address, address + size)` holds `address`
    pub fn lookup_containing(&self, address: u64) -> Option<AllocationIndex> {
        let idx = self.records.partition_point(|r| r.address <= address);
        if idx == 0 {
            return None;
        }
        let record = &self.records[idx - 1];
        record.contains(address).then_some(record.index)
    }

    /// Lowest start and highest limit over all allocations
    pub fn address_bounds(&self) -> Option<(u64, u64)> {
        Some((self.records.first()?.address, self.records.last()?.limit()))
    }

    pub fn source_reports(&self) -> &[SourceReport] {
        &self.reports
    }

    pub fn arenas(&self) -> &BTreeMap<u64, ArenaStats> {
        &self.arenas
    }

    /// Allocations attributed to the arena starting at `arena`
    pub fn arena_records(&self, arena: u64) -> impl Iterator<Item = &AllocationRecord> {
        self.records
            .iter()
            .filter(move |r| r.arena == Some(arena))
    }
}
