//! Snapshots assembled from raw per-segment dump files

use super::{MappedRange, PermissionClass, Segment, SegmentTable, Snapshot, SnapshotError};
use memmap2::Mmap;
use std::fs::File;
use std::path::PathBuf;
use tracing::warn;

/// One dumped segment: the bytes in `file` were captured at `address`
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub address: u64,
    pub file: PathBuf,
    pub permissions: PermissionClass,
}

/// Snapshot made of memory-mapped dump files, one per segment
pub struct RawDumpImage {
    maps: Vec<Mmap>,
    table: SegmentTable,
}

impl RawDumpImage {
    pub fn open(segments: &[RawSegment]) -> Result<Self, SnapshotError> {
        let mut maps = Vec::with_capacity(segments.len());
        let mut table = SegmentTable::default();
        for segment in segments {
            let file = File::open(&segment.file)?;
            if file.metadata()?.len() == 0 {
                warn!(file = %segment.file.display(), "skipping empty dump file");
                continue;
            }
            let mmap = unsafe { Mmap::map(&file) }?;
            let len = mmap.len() as u64;
            table.insert(Segment {
                range: MappedRange::spanning(segment.address, len, segment.permissions)?,
                backing: maps.len(),
                offset: 0,
                captured: len,
            })?;
            maps.push(mmap);
        }
        Ok(Self { maps, table })
    }
}

impl Snapshot for RawDumpImage {
    fn read(&self, address: u64, len: u64) -> Result<&[u8], SnapshotError> {
        let (segment, offset) = self.table.resolve(address, len)?;
        let start = segment.offset + offset as usize;
        Ok(&self.maps[segment.backing][start..start + len as usize])
    }

    fn mapped_ranges(&self) -> &[MappedRange] {
        self.table.ranges()
    }
}
