//! Byte-addressable access to a frozen process image
//!
//! Every analysis in this crate reads the target exclusively through the
//! [`Snapshot`] trait. Three implementations are provided:
//!
//! - [`MemoryImage`]: segments held in memory (synthetic images, tests, fuzzing)
//! - [`RawDumpImage`]: one memory-mapped raw dump file per segment
//! - [`CoreFile`]: an ELF core file whose `PT_LOAD` segments form the image
//!
//! Images are 64-bit little-endian. A read never spans two segments.

mod core_file;
mod raw_dump;

pub use core_file::CoreFile;
#[cfg(test)]
pub(crate) use core_file::testing as core_testing;
pub use raw_dump::{RawDumpImage, RawSegment};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width in bytes of a pointer in the analyzed process
pub const POINTER_SIZE: u64 = 8;

/// Errors raised while reading a snapshot
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("address {0:#x} is not mapped in the snapshot")]
    Unmapped(u64),

    #[error("read of {len:#x} bytes at {address:#x} runs past the end of its segment")]
    CrossesSegment { address: u64, len: u64 },

    #[error("address {address:#x} lies beyond the data captured for its segment")]
    Truncated { address: u64 },

    #[error("segment at {0:#x} overlaps an existing segment")]
    OverlappingSegment(u64),

    #[error("segment of {len:#x} bytes at {address:#x} wraps past the end of the address space")]
    WrapsAddressSpace { address: u64, len: u64 },

    #[error("failed to parse core file: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse permission class of a mapped range
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionClass {
    /// Not readable, writable or executable
    Inaccessible,
    /// Readable only
    ReadOnly,
    /// Readable and executable but not writable
    RxOnly,
    /// Writable, whatever the other bits say
    Writable,
}

impl PermissionClass {
    pub const ALL: [PermissionClass; 4] = [
        PermissionClass::Inaccessible,
        PermissionClass::ReadOnly,
        PermissionClass::RxOnly,
        PermissionClass::Writable,
    ];

    /// Classify a set of protection bits
    pub fn from_flags(readable: bool, writable: bool, executable: bool) -> Self {
        match (readable, writable, executable) {
            (_, true, _) => PermissionClass::Writable,
            (_, false, true) => PermissionClass::RxOnly,
            (true, false, false) => PermissionClass::ReadOnly,
            (false, false, false) => PermissionClass::Inaccessible,
        }
    }

    /// Parse an `rwx`-style triple such as `"rw-"` or `"r-x"`
    pub fn from_mode(mode: &str) -> Option<Self> {
        let bytes = mode.as_bytes();
        if bytes.len() != 3 {
            return None;
        }
        let flag = |i: usize, expected: u8| match bytes[i] {
            b'-' => Some(false),
            b if b == expected => Some(true),
            _ => None,
        };
        Some(Self::from_flags(flag(0, b'r')?, flag(1, b'w')?, flag(2, b'x')?))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PermissionClass::Inaccessible => "inaccessible",
            PermissionClass::ReadOnly => "readonly",
            PermissionClass::RxOnly => "rxonly",
            PermissionClass::Writable => "writable",
        }
    }
}

impl fmt::Display for PermissionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PermissionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inaccessible" => Ok(PermissionClass::Inaccessible),
            "readonly" => Ok(PermissionClass::ReadOnly),
            "rxonly" => Ok(PermissionClass::RxOnly),
            "writable" => Ok(PermissionClass::Writable),
            other => Self::from_mode(other).ok_or_else(|| {
                format!(
                    "Invalid permission class: {}. Expected inaccessible, readonly, rxonly, writable or an rwx triple",
                    other
                )
            }),
        }
    }
}

/// A contiguous mapped range `[start, end)` of the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MappedRange {
    pub start: u64,
    pub end: u64,
    pub permissions: PermissionClass,
}

impl MappedRange {
    /// The range of `len` bytes starting at `start`
    pub fn spanning(
        start: u64,
        len: u64,
        permissions: PermissionClass,
    ) -> Result<Self, SnapshotError> {
        let end = start
            .checked_add(len)
            .ok_or(SnapshotError::WrapsAddressSpace {
                address: start,
                len,
            })?;
        Ok(Self {
            start,
            end,
            permissions,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }
}

/// Read-only view of a captured process image, shareable across threads
pub trait Snapshot: Send + Sync {
    /// Read `len` bytes at `address`; the whole read must fall in one segment
    fn read(&self, address: u64, len: u64) -> Result<&[u8], SnapshotError>;

    /// All mapped ranges, sorted by start address
    fn mapped_ranges(&self) -> &[MappedRange];

    fn is_mapped(&self, address: u64) -> bool {
        let ranges = self.mapped_ranges();
        let idx = ranges.partition_point(|r| r.start <= address);
        idx > 0 && ranges[idx - 1].contains(address)
    }

    /// Read one pointer-width little-endian word
    fn read_word(&self, address: u64) -> Option<u64> {
        let bytes = self.read(address, POINTER_SIZE).ok()?;
        word_at(bytes, 0)
    }
}

/// Decode the little-endian word at byte `offset` of `bytes`
pub fn word_at(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset.checked_add(POINTER_SIZE as usize)?)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

/// Where the bytes of one segment live in its backing store
#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    pub range: MappedRange,
    /// Backing buffer (or file) the segment reads from
    pub backing: usize,
    /// Offset of the segment's first byte inside its backing
    pub offset: usize,
    /// Bytes actually captured; may be shorter than the mapped range
    pub captured: u64,
}

/// Sorted, non-overlapping segment table shared by the snapshot types
#[derive(Debug, Default)]
pub(crate) struct SegmentTable {
    segments: Vec<Segment>,
    ranges: Vec<MappedRange>,
}

impl SegmentTable {
    pub fn insert(&mut self, segment: Segment) -> Result<(), SnapshotError> {
        let idx = self
            .segments
            .partition_point(|s| s.range.start < segment.range.start);
        let overlaps_prev = idx > 0 && self.segments[idx - 1].range.end > segment.range.start;
        let overlaps_next =
            idx < self.segments.len() && self.segments[idx].range.start < segment.range.end;
        if overlaps_prev || overlaps_next {
            return Err(SnapshotError::OverlappingSegment(segment.range.start));
        }
        self.segments.insert(idx, segment);
        self.ranges.insert(idx, segment.range);
        Ok(())
    }

    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    /// Locate a read, returning the segment and the offset inside it
    pub fn resolve(&self, address: u64, len: u64) -> Result<(&Segment, u64), SnapshotError> {
        let idx = self.segments.partition_point(|s| s.range.start <= address);
        if idx == 0 || !self.segments[idx - 1].range.contains(address) {
            return Err(SnapshotError::Unmapped(address));
        }
        let segment = &self.segments[idx - 1];
        let offset = address - segment.range.start;
        let end = address
            .checked_add(len)
            .ok_or(SnapshotError::CrossesSegment { address, len })?;
        if end > segment.range.end {
            return Err(SnapshotError::CrossesSegment { address, len });
        }
        if offset + len > segment.captured {
            return Err(SnapshotError::Truncated {
                address: segment.range.start + segment.captured,
            });
        }
        Ok((segment, offset))
    }
}

/// Snapshot whose segments live in memory
///
/// Used to build synthetic images:
///
/// ```
/// use heapsift::snapshot::{MemoryImage, PermissionClass, Snapshot};
///
/// let mut image = MemoryImage::new();
/// image.map(0x1000, vec![0; 64], PermissionClass::Writable).unwrap();
/// image.write_word(0x1008, 0xdead_beef);
/// assert_eq!(image.read_word(0x1008), Some(0xdead_beef));
/// ```
#[derive(Debug, Default)]
pub struct MemoryImage {
    table: SegmentTable,
    buffers: Vec<Vec<u8>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `address`
    pub fn map(
        &mut self,
        address: u64,
        bytes: Vec<u8>,
        permissions: PermissionClass,
    ) -> Result<&mut Self, SnapshotError> {
        let len = bytes.len() as u64;
        self.table.insert(Segment {
            range: MappedRange::spanning(address, len, permissions)?,
            backing: self.buffers.len(),
            offset: 0,
            captured: len,
        })?;
        self.buffers.push(bytes);
        Ok(self)
    }

    /// Overwrite the word at `address`
    ///
    /// # Panics
    /// Panics if the word is not fully inside one mapped segment.
    pub fn write_word(&mut self, address: u64, value: u64) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Overwrite bytes at `address`
    ///
    /// # Panics
    /// Panics if the bytes are not fully inside one mapped segment.
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
        let (segment, offset) = match self.table.resolve(address, bytes.len() as u64) {
            Ok((segment, offset)) => (*segment, offset as usize),
            Err(e) => panic!("write outside the image: {}", e),
        };
        self.buffers[segment.backing][offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Snapshot for MemoryImage {
    fn read(&self, address: u64, len: u64) -> Result<&[u8], SnapshotError> {
        let (segment, offset) = self.table.resolve(address, len)?;
        let start = segment.offset + offset as usize;
        Ok(&self.buffers[segment.backing][start..start + len as usize])
    }

    fn mapped_ranges(&self) -> &[MappedRange] {
        self.table.ranges()
    }
}
