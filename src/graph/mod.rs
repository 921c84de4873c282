//! Reference graph over allocations and roots
//!
//! Edges are derived by a conservative scan: every pointer-width word of a
//! used allocation (and of every root) is looked up with
//! [`Finder::lookup_containing`]; a hit on a used allocation is an edge.
//! Any bit pattern that happens to fall inside an allocation counts as a
//! reference, so liveness is over-approximated and never under-approximated.
//! Free allocations neither hold nor receive references.
//!
//! # Layout
//!
//! Outgoing and incoming edges are stored in compressed sparse row form
//! indexed directly by [`AllocationIndex`]:
//!
//! ```text
//! out_starts: [0, 2, 2, 3]      allocation i owns out_edges[out_starts[i]..out_starts[i + 1]]
//! out_edges:  [(1, +0x8), (2, +0x10), (0, +0x0)]
//! ```
//!
//! Each allocation's outgoing edges are sorted by target index, then by the
//! byte offset of the pointer word; incoming references list roots first (in
//! root order), then allocations in index order.

mod reachability;
mod roots;

pub use reachability::{Explanation, PathStep, Reachability, ReferencePath};
pub use roots::{
    ModuleRange, RegisterValue, Root, RootContents, RootId, RootKind, RootProvider, RootSet,
    ThreadStack,
};

use crate::allocations::{AllocationIndex, Finder};
use crate::snapshot::{Snapshot, SnapshotError, POINTER_SIZE};
use serde::Serialize;
use tracing::{debug, warn};

/// Holder of a pointer word: a root or an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Holder {
    Root(RootId),
    Allocation(AllocationIndex),
}

/// Outgoing edge: the word at `offset` in the holder points into `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub target: AllocationIndex,
    pub offset: u64,
}

/// Incoming reference: the word at `offset` in `holder` points here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reference {
    pub holder: Holder,
    pub offset: u64,
}

/// Directed reference relation among roots and allocations
#[derive(Debug, Default)]
pub struct ReferenceGraph {
    out_starts: Vec<usize>,
    out_edges: Vec<Edge>,
    root_edges: Vec<Vec<Edge>>,
    in_starts: Vec<usize>,
    in_refs: Vec<Reference>,
}

impl ReferenceGraph {
    /// Scan every used allocation and every root once
    pub fn build(snapshot: &dyn Snapshot, finder: &Finder, roots: &RootSet) -> Self {
        let count = finder.count();
        let mut unreadable = 0usize;

        let mut root_edges = Vec::with_capacity(roots.len());
        for root in roots.iter() {
            let mut edges = Vec::new();
            match root.contents {
                RootContents::Range { start, end } => {
                    if !scan_root_range(snapshot, start, end, finder, &mut edges) {
                        warn!(root = %root, "root has no captured bytes");
                        unreadable += 1;
                    }
                }
                RootContents::Value(value) => {
                    scan_words(&value.to_le_bytes(), 0, finder, &mut edges)
                }
            }
            edges.sort_unstable_by_key(|e| (e.target, e.offset));
            root_edges.push(edges);
        }

        let mut out_starts = Vec::with_capacity(count + 1);
        let mut out_edges = Vec::new();
        out_starts.push(0);
        for record in finder.records() {
            if record.used {
                match snapshot.read(record.address, record.size) {
                    Ok(bytes) => {
                        let first = out_edges.len();
                        scan_words(bytes, 0, finder, &mut out_edges);
                        out_edges[first..].sort_unstable_by_key(|e| (e.target, e.offset));
                    }
                    Err(_) => unreadable += 1,
                }
            }
            out_starts.push(out_edges.len());
        }

        // Incoming references by counting sort on target
        let mut in_counts = vec![0usize; count + 1];
        for edge in root_edges.iter().flatten().chain(out_edges.iter()) {
            in_counts[edge.target as usize + 1] += 1;
        }
        for i in 1..in_counts.len() {
            in_counts[i] += in_counts[i - 1];
        }
        let in_starts = in_counts.clone();
        let mut cursor = in_counts;
        let placeholder = Reference {
            holder: Holder::Allocation(0),
            offset: 0,
        };
        let total = out_edges.len() + root_edges.iter().map(Vec::len).sum::<usize>();
        let mut in_refs = vec![placeholder; total];
        let mut place = |target: AllocationIndex, reference: Reference| {
            let slot = &mut cursor[target as usize];
            in_refs[*slot] = reference;
            *slot += 1;
        };
        for (root, edges) in root_edges.iter().enumerate() {
            for edge in edges {
                place(
                    edge.target,
                    Reference {
                        holder: Holder::Root(RootId(root as u32)),
                        offset: edge.offset,
                    },
                );
            }
        }
        for from in 0..count {
            for edge in &out_edges[out_starts[from]..out_starts[from + 1]] {
                place(
                    edge.target,
                    Reference {
                        holder: Holder::Allocation(from as AllocationIndex),
                        offset: edge.offset,
                    },
                );
            }
        }

        debug!(
            allocations = count,
            roots = roots.len(),
            edges = in_refs.len(),
            unreadable,
            "reference graph built"
        );
        Self {
            out_starts,
            out_edges,
            root_edges,
            in_starts,
            in_refs,
        }
    }

    /// References held by allocation `index`
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn outgoing(&self, index: AllocationIndex) -> &[Edge] {
        let i = self.check(index);
        &self.out_edges[self.out_starts[i]..self.out_starts[i + 1]]
    }

    /// References into allocation `index`
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn incoming(&self, index: AllocationIndex) -> &[Reference] {
        let i = self.check(index);
        &self.in_refs[self.in_starts[i]..self.in_starts[i + 1]]
    }

    /// References held by a root
    ///
    /// # Panics
    /// Panics if `root` is unknown.
    pub fn root_edges(&self, root: RootId) -> &[Edge] {
        match self.root_edges.get(root.0 as usize) {
            Some(edges) => edges,
            None => panic!("Invalid root id {}", root.0),
        }
    }

    pub fn edge_count(&self) -> usize {
        self.in_refs.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.out_starts.len().saturating_sub(1)
    }

    fn check(&self, index: AllocationIndex) -> usize {
        let i = index as usize;
        if i >= self.allocation_count() {
            panic!(
                "Invalid allocation index {} (allocation count {})",
                index,
                self.allocation_count()
            );
        }
        i
    }
}

/// Scan the captured parts of every mapping a root range intersects
///
/// Module images span several mappings and stacks may be captured only in
/// part, so each intersection is read on its own and cut at the captured
/// bytes. Offsets stay relative to `start`. Returns false when nothing of the
/// range could be read.
fn scan_root_range(
    snapshot: &dyn Snapshot,
    start: u64,
    end: u64,
    finder: &Finder,
    edges: &mut Vec<Edge>,
) -> bool {
    let mut scanned = false;
    for mapped in snapshot.mapped_ranges() {
        if mapped.end <= start || mapped.start >= end {
            continue;
        }
        // First word boundary of the root inside this mapping
        let skip = mapped.start.saturating_sub(start).next_multiple_of(POINTER_SIZE);
        let Some(low) = start.checked_add(skip) else {
            continue;
        };
        let high = end.min(mapped.end);
        if low >= high {
            continue;
        }
        let bytes = match snapshot.read(low, high - low) {
            Ok(bytes) => bytes,
            Err(SnapshotError::Truncated { address }) if address > low => {
                match snapshot.read(low, address - low) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(start = %format!("{:#x}", low), error = %e, "root piece not readable");
                        continue;
                    }
                }
            }
            Err(e) => {
                warn!(start = %format!("{:#x}", low), error = %e, "root piece not readable");
                continue;
            }
        };
        scan_words(bytes, skip, finder, edges);
        scanned = true;
    }
    scanned
}

/// Emit an edge for every aligned word of `bytes` that lands in a used
/// allocation; `base` is the holder offset of `bytes[0]`
fn scan_words(bytes: &[u8], base: u64, finder: &Finder, edges: &mut Vec<Edge>) {
    let Some((low, high)) = finder.address_bounds() else {
        return;
    };
    for (i, word) in bytes.chunks_exact(POINTER_SIZE as usize).enumerate() {
        let mut raw = [0u8; POINTER_SIZE as usize];
        raw.copy_from_slice(word);
        let value = u64::from_le_bytes(raw);
        if value < low || value >= high {
            continue;
        }
        if let Some(target) = finder.lookup_containing(value) {
            if finder.record_at(target).used {
                edges.push(Edge {
                    target,
                    offset: base + i as u64 * POINTER_SIZE,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocations::{AllocationSource, RawRecord, RecordListSource};
    use crate::snapshot::core_testing::{core_bytes, write_core};
    use crate::snapshot::{CoreFile, MemoryImage, PermissionClass};
    use object::elf::{PF_R, PF_W, PT_LOAD};

    const HEAP: u64 = 0x10000;
    const STACK: u64 = 0x7000;

    fn record(address: u64, size: u64, used: bool) -> RawRecord {
        RawRecord {
            address,
            size,
            used,
            arena: None,
        }
    }

    /// Allocations: 0 @HEAP (0x20), 1 @HEAP+0x20 (0x20), 2 @HEAP+0x40 (0x20, free)
    fn fixture() -> (MemoryImage, Finder, RootSet) {
        let mut image = MemoryImage::new();
        image
            .map(HEAP, vec![0; 0x60], PermissionClass::Writable)
            .unwrap();
        image
            .map(STACK, vec![0; 0x20], PermissionClass::Writable)
            .unwrap();
        let sources: Vec<Box<dyn AllocationSource>> = vec![Box::new(RecordListSource::new(
            "list",
            vec![
                record(HEAP, 0x20, true),
                record(HEAP + 0x20, 0x20, true),
                record(HEAP + 0x40, 0x20, false),
            ],
        ))];
        let finder = Finder::build(&image, &sources);
        let mut roots = RootSet::new();
        roots.push(
            RootKind::Stack { thread: 1 },
            RootContents::Range {
                start: STACK,
                end: STACK + 0x20,
            },
        );
        (image, finder, roots)
    }

    #[test]
    fn test_edges_from_allocation_words() {
        let (mut image, finder, roots) = fixture();
        image.write_word(HEAP + 0x8, HEAP + 0x28);
        image.write_word(HEAP + 0x10, HEAP + 0x20);
        let graph = ReferenceGraph::build(&image, &finder, &roots);

        let out = graph.outgoing(0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Edge { target: 1, offset: 0x8 });
        assert_eq!(out[1], Edge { target: 1, offset: 0x10 });
        assert_eq!(graph.incoming(1).len(), 2);
        assert!(graph.incoming(0).is_empty());
    }

    #[test]
    fn test_free_allocations_neither_hold_nor_receive() {
        let (mut image, finder, roots) = fixture();
        image.write_word(HEAP, HEAP + 0x40);
        image.write_word(HEAP + 0x40, HEAP);
        let graph = ReferenceGraph::build(&image, &finder, &roots);
        assert!(graph.outgoing(0).is_empty());
        assert!(graph.outgoing(2).is_empty());
        assert!(graph.incoming(0).is_empty());
    }

    #[test]
    fn test_root_edges_and_incoming_order() {
        let (mut image, finder, mut roots) = fixture();
        image.write_word(STACK + 0x18, HEAP + 0x20);
        image.write_word(HEAP, HEAP + 0x20);
        roots.push(
            RootKind::Register {
                thread: 1,
                name: "rdi".to_string(),
            },
            RootContents::Value(HEAP + 0x30),
        );
        let graph = ReferenceGraph::build(&image, &finder, &roots);

        assert_eq!(graph.root_edges(RootId(0)), &[Edge { target: 1, offset: 0x18 }]);
        assert_eq!(graph.root_edges(RootId(1)), &[Edge { target: 1, offset: 0 }]);
        let incoming = graph.incoming(1);
        assert_eq!(incoming.len(), 3);
        assert_eq!(incoming[0].holder, Holder::Root(RootId(0)));
        assert_eq!(incoming[1].holder, Holder::Root(RootId(1)));
        assert_eq!(incoming[2].holder, Holder::Allocation(0));
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_root_spanning_two_mappings() {
        let (mut image, finder, _) = fixture();
        image
            .map(0x4000, vec![0; 0x100], PermissionClass::ReadOnly)
            .unwrap();
        image
            .map(0x4100, vec![0; 0x100], PermissionClass::Writable)
            .unwrap();
        image.write_word(0x4180, HEAP);
        let mut roots = RootSet::new();
        roots.push(
            RootKind::Module {
                name: "app".to_string(),
            },
            RootContents::Range {
                start: 0x4000,
                end: 0x4200,
            },
        );
        let graph = ReferenceGraph::build(&image, &finder, &roots);
        assert_eq!(graph.root_edges(RootId(0)), &[Edge { target: 0, offset: 0x180 }]);
    }

    #[test]
    fn test_root_with_unmapped_gap_scans_mapped_parts() {
        let (mut image, finder, _) = fixture();
        image
            .map(0x4000, vec![0; 0x10], PermissionClass::Writable)
            .unwrap();
        image
            .map(0x4100, vec![0; 0x10], PermissionClass::Writable)
            .unwrap();
        image.write_word(0x4000, HEAP + 0x20);
        image.write_word(0x4108, HEAP);
        let mut roots = RootSet::new();
        roots.push(
            RootKind::Module {
                name: "app".to_string(),
            },
            RootContents::Range {
                start: 0x4000,
                end: 0x4200,
            },
        );
        let graph = ReferenceGraph::build(&image, &finder, &roots);
        assert_eq!(
            graph.root_edges(RootId(0)),
            &[
                Edge { target: 0, offset: 0x108 },
                Edge { target: 1, offset: 0 },
            ]
        );
    }

    #[test]
    fn test_stack_with_uncaptured_tail_scans_captured_part() {
        let (_, finder, _) = fixture();
        let bytes = core_bytes(
            &[(PT_LOAD, PF_R | PF_W, 0x100, STACK, 0x100, 0x100)],
            &[(0x110, &HEAP.to_le_bytes()[..])],
            0x120,
        );
        let file = write_core(&bytes);
        let core = CoreFile::open(file.path()).unwrap();
        let mut roots = RootSet::new();
        roots.push(
            RootKind::Stack { thread: 1 },
            RootContents::Range {
                start: STACK,
                end: STACK + 0x100,
            },
        );
        let graph = ReferenceGraph::build(&core, &finder, &roots);
        assert_eq!(graph.root_edges(RootId(0)), &[Edge { target: 0, offset: 0x10 }]);
    }

    #[test]
    fn test_misaligned_words_ignored() {
        let (mut image, finder, roots) = fixture();
        image.write_bytes(HEAP + 0x4, &(HEAP + 0x20).to_le_bytes());
        let graph = ReferenceGraph::build(&image, &finder, &roots);
        assert!(graph.outgoing(0).is_empty());
    }

    #[test]
    #[should_panic(expected = "Invalid allocation index")]
    fn test_out_of_range_index_panics() {
        let (image, finder, roots) = fixture();
        let graph = ReferenceGraph::build(&image, &finder, &roots);
        graph.outgoing(3);
    }
}
