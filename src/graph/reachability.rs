//! Reachability from roots and shortest-path explanations
//!
//! A single breadth-first search from all roots marks every allocation that
//! is still referenced (the mark phase of a tracing collector, run once over
//! a frozen heap) and records, for each reached allocation, the holder that
//! first reached it. [`Reachability::explain`] walks those predecessors back
//! to a root, which yields a shortest path.
//!
//! # Tie-break
//!
//! Among equally short paths the result is fixed by discovery order:
//!
//! 1. roots are seeded in root-id order;
//! 2. each holder's references are expanded in ascending target allocation
//!    index, and for the same target the lowest word offset is used;
//! 3. the first discovery of an allocation fixes its predecessor.
//!
//! The work list is an explicit FIFO queue and visited state is a vector
//! indexed by [`AllocationIndex`], so snapshots with millions of allocations
//! need neither recursion nor hashing.

use super::{ReferenceGraph, RootId, RootSet};
use crate::allocations::AllocationIndex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predecessor {
    Unvisited,
    Root { root: RootId, offset: u64 },
    Allocation { index: AllocationIndex, offset: u64 },
}

/// One hop of a reference path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PathStep {
    pub index: AllocationIndex,
    /// Offset of the pointer word inside the previous holder
    pub via_offset: u64,
}

/// Shortest chain of references from a root to an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferencePath {
    pub root: RootId,
    /// Allocations from the one the root references to the target
    pub steps: Vec<PathStep>,
}

impl ReferencePath {
    pub fn target(&self) -> Option<AllocationIndex> {
        self.steps.last().map(|s| s.index)
    }
}

/// Answer to "why is this allocation still reachable"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Explanation {
    Reachable(ReferencePath),
    /// No root reaches the allocation: a leak candidate
    Unreachable,
}

/// Breadth-first search tree over the reference graph
#[derive(Debug)]
pub struct Reachability {
    predecessors: Vec<Predecessor>,
    reachable: usize,
}

impl Reachability {
    pub fn compute(graph: &ReferenceGraph, roots: &RootSet) -> Self {
        let mut predecessors = vec![Predecessor::Unvisited; graph.allocation_count()];
        let mut queue = VecDeque::new();

        for root in roots.iter() {
            for edge in graph.root_edges(root.id) {
                let slot = &mut predecessors[edge.target as usize];
                if *slot == Predecessor::Unvisited {
                    *slot = Predecessor::Root {
                        root: root.id,
                        offset: edge.offset,
                    };
                    queue.push_back(edge.target);
                }
            }
        }

        let mut reachable = queue.len();
        while let Some(index) = queue.pop_front() {
            for edge in graph.outgoing(index) {
                let slot = &mut predecessors[edge.target as usize];
                if *slot == Predecessor::Unvisited {
                    *slot = Predecessor::Allocation {
                        index,
                        offset: edge.offset,
                    };
                    reachable += 1;
                    queue.push_back(edge.target);
                }
            }
        }

        debug!(
            reachable,
            total = predecessors.len(),
            "reachability computed"
        );
        Self {
            predecessors,
            reachable,
        }
    }

    /// # Panics
    /// Panics if `index` is out of range.
    pub fn is_reachable(&self, index: AllocationIndex) -> bool {
        self.predecessor(index) != Predecessor::Unvisited
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable
    }

    /// Shortest reference path from a root to `target`
    ///
    /// # Panics
    /// Panics if `target` is out of range.
    pub fn explain(&self, target: AllocationIndex) -> Explanation {
        let mut steps = Vec::new();
        let mut current = target;
        loop {
            match self.predecessor(current) {
                Predecessor::Unvisited => return Explanation::Unreachable,
                Predecessor::Root { root, offset } => {
                    steps.push(PathStep {
                        index: current,
                        via_offset: offset,
                    });
                    steps.reverse();
                    return Explanation::Reachable(ReferencePath { root, steps });
                }
                Predecessor::Allocation { index, offset } => {
                    steps.push(PathStep {
                        index: current,
                        via_offset: offset,
                    });
                    current = index;
                }
            }
        }
    }

    fn predecessor(&self, index: AllocationIndex) -> Predecessor {
        match self.predecessors.get(index as usize) {
            Some(&p) => p,
            None => panic!("Invalid allocation index {}", index),
        }
    }
}
