//! ELF core file snapshots
//!
//! The file is memory-mapped once; every `PT_LOAD` program header becomes a
//! segment. Segments whose file data is shorter than their memory size (or
//! that were cut off by a truncated dump) keep their full mapped range but
//! fail reads past the captured bytes.

use super::{MappedRange, PermissionClass, Segment, SegmentTable, Snapshot, SnapshotError};
use memmap2::Mmap;
use object::elf::{ET_CORE, PF_R, PF_W, PF_X, PT_LOAD};
use object::read::elf::{ElfFile64, FileHeader, ProgramHeader};
use object::Endianness;
use std::fs::File;
use std::path::Path;
use tracing::{debug, warn};

/// Snapshot backed by an ELF core file
pub struct CoreFile {
    mmap: Mmap,
    table: SegmentTable,
}

impl CoreFile {
    /// Map and index a core file
    pub fn open(path: &Path) -> Result<Self, SnapshotError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let table = Self::index_segments(&mmap)?;
        debug!(
            path = %path.display(),
            segments = table.ranges().len(),
            "indexed core file"
        );
        Ok(Self { mmap, table })
    }

    fn index_segments(data: &[u8]) -> Result<SegmentTable, SnapshotError> {
        let elf = ElfFile64::<Endianness>::parse(data)
            .map_err(|e| SnapshotError::Parse(e.to_string()))?;
        let endian = elf.endian();
        if elf.elf_header().e_type(endian) != ET_CORE {
            return Err(SnapshotError::Parse("not an ELF core file".to_string()));
        }

        let mut table = SegmentTable::default();
        for header in elf.elf_program_headers() {
            if header.p_type(endian) != PT_LOAD {
                continue;
            }
            let flags = header.p_flags(endian);
            let start = header.p_vaddr(endian);
            let mem_size = header.p_memsz(endian);
            if mem_size == 0 {
                continue;
            }
            let file_offset = header.p_offset(endian);
            let file_size = header.p_filesz(endian);

            // Truncated dumps keep the mapping but lose the tail of the data
            let available = (data.len() as u64).saturating_sub(file_offset);
            let captured = file_size.min(available).min(mem_size);
            if captured < file_size {
                warn!(
                    start = %format!("{:#x}", start),
                    "core file segment is truncated"
                );
            }

            let permissions =
                PermissionClass::from_flags(flags & PF_R != 0, flags & PF_W != 0, flags & PF_X != 0);
            let range = match MappedRange::spanning(start, mem_size, permissions) {
                Ok(range) => range,
                Err(e) => {
                    warn!(error = %e, "skipping core file segment");
                    continue;
                }
            };
            let segment = Segment {
                range,
                backing: 0,
                offset: if captured == 0 { 0 } else { file_offset as usize },
                captured,
            };
            if let Err(e) = table.insert(segment) {
                warn!(error = %e, "skipping core file segment");
            }
        }
        Ok(table)
    }
}

impl Snapshot for CoreFile {
    fn read(&self, address: u64, len: u64) -> Result<&[u8], SnapshotError> {
        let (segment, offset) = self.table.resolve(address, len)?;
        let start = segment.offset + offset as usize;
        Ok(&self.mmap[start..start + len as usize])
    }

    fn mapped_ranges(&self) -> &[MappedRange] {
        self.table.ranges()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use object::elf::ET_CORE;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;

    /// `(p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz)`
    pub type ProgramHeaderFields = (u32, u32, u64, u64, u64, u64);

    /// Minimal little-endian ELF64 core: header, program headers, then `data`
    /// at the file offsets the headers name
    pub fn core_bytes(
        headers: &[ProgramHeaderFields],
        data: &[(usize, &[u8])],
        len: usize,
    ) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[..4].copy_from_slice(b"\x7fELF");
        bytes[4] = 2; // ELFCLASS64
        bytes[5] = 1; // ELFDATA2LSB
        bytes[6] = 1; // EV_CURRENT
        bytes[16..18].copy_from_slice(&ET_CORE.to_le_bytes());
        bytes[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        bytes[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        bytes[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        bytes[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        bytes[56..58].copy_from_slice(&(headers.len() as u16).to_le_bytes());
        bytes[58..60].copy_from_slice(&64u16.to_le_bytes());

        for (i, &(p_type, p_flags, offset, vaddr, filesz, memsz)) in headers.iter().enumerate() {
            let at = EHDR_SIZE + i * PHDR_SIZE;
            let header = &mut bytes[at..at + PHDR_SIZE];
            header[0..4].copy_from_slice(&p_type.to_le_bytes());
            header[4..8].copy_from_slice(&p_flags.to_le_bytes());
            header[8..16].copy_from_slice(&offset.to_le_bytes());
            header[16..24].copy_from_slice(&vaddr.to_le_bytes());
            header[24..32].copy_from_slice(&vaddr.to_le_bytes());
            header[32..40].copy_from_slice(&filesz.to_le_bytes());
            header[40..48].copy_from_slice(&memsz.to_le_bytes());
            header[48..56].copy_from_slice(&0x1000u64.to_le_bytes());
        }
        for &(offset, chunk) in data {
            bytes[offset..offset + chunk.len()].copy_from_slice(chunk);
        }
        bytes
    }

    pub fn write_core(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{core_bytes, write_core};
    use super::*;
    use object::elf::PT_NOTE;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_indexes_load_segments_with_permissions() {
        let bytes = core_bytes(
            &[
                (PT_NOTE, 0, 0x200, 0, 0, 0),
                (PT_LOAD, PF_R | PF_X, 0x220, 0x20000, 0x10, 0x10),
                (PT_LOAD, PF_R | PF_W, 0x200, 0x10000, 0x20, 0x20),
                (PT_LOAD, PF_R, 0x230, 0x30000, 0x10, 0x10),
                (PT_LOAD, 0, 0x240, 0x40000, 0, 0x1000),
                (PT_LOAD, PF_R | PF_W, 0x240, 0x50000, 0, 0),
            ],
            &[(0x200, &0xfeed_u64.to_le_bytes()[..]), (0x220, &[0xcc; 0x10][..])],
            0x240,
        );
        let file = write_core(&bytes);
        let core = CoreFile::open(file.path()).unwrap();

        let ranges: Vec<_> = core
            .mapped_ranges()
            .iter()
            .map(|r| (r.start, r.end, r.permissions))
            .collect();
        assert_eq!(
            ranges,
            vec![
                (0x10000, 0x10020, PermissionClass::Writable),
                (0x20000, 0x20010, PermissionClass::RxOnly),
                (0x30000, 0x30010, PermissionClass::ReadOnly),
                (0x40000, 0x41000, PermissionClass::Inaccessible),
            ]
        );
        assert_eq!(core.read_word(0x10000), Some(0xfeed));
        assert_eq!(core.read(0x20008, 8).unwrap(), &[0xcc; 8]);
    }

    #[test]
    fn test_short_file_data_reads_truncated() {
        let bytes = core_bytes(
            &[(PT_LOAD, PF_R | PF_W, 0x100, 0x30000, 0x10, 0x40)],
            &[(0x100, &0x1234_u64.to_le_bytes()[..])],
            0x110,
        );
        let file = write_core(&bytes);
        let core = CoreFile::open(file.path()).unwrap();

        assert_eq!(core.mapped_ranges()[0].end, 0x30040);
        assert!(core.is_mapped(0x30030));
        assert_eq!(core.read_word(0x30000), Some(0x1234));
        assert!(matches!(
            core.read(0x30018, 8),
            Err(SnapshotError::Truncated { address: 0x30010 })
        ));
    }

    #[test]
    fn test_file_cut_short_keeps_mapping() {
        // The header promises 0x40 bytes of data but the file ends after 0x8
        let bytes = core_bytes(&[(PT_LOAD, PF_R | PF_W, 0x100, 0x60000, 0x40, 0x40)], &[], 0x108);
        let file = write_core(&bytes);
        let core = CoreFile::open(file.path()).unwrap();

        assert_eq!(core.read_word(0x60000), Some(0));
        assert!(matches!(
            core.read(0x60008, 8),
            Err(SnapshotError::Truncated { address: 0x60008 })
        ));
    }

    #[test]
    fn test_wrapping_segment_skipped() {
        let bytes = core_bytes(
            &[
                (PT_LOAD, PF_R | PF_W, 0x100, u64::MAX - 0xf, 0x20, 0x20),
                (PT_LOAD, PF_R | PF_W, 0x100, 0x10000, 0x20, 0x20),
            ],
            &[],
            0x120,
        );
        let file = write_core(&bytes);
        let core = CoreFile::open(file.path()).unwrap();
        assert_eq!(core.mapped_ranges().len(), 1);
        assert_eq!(core.mapped_ranges()[0].start, 0x10000);
    }

    #[test]
    fn test_rejects_non_elf() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an elf file").unwrap();
        file.flush().unwrap();

        let result = CoreFile::open(file.path());
        assert!(matches!(result, Err(SnapshotError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = CoreFile::open(Path::new("/nonexistent/heapsift/core"));
        assert!(matches!(result, Err(SnapshotError::Io(_))));
    }
}
