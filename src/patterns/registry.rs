//! Ordered recognizer registry and the fixed-point classification driver

use super::{Candidate, Classification, ClassifyContext, Recognizer};
use crate::allocations::{AllocationIndex, Finder, TagHolder};
use crate::graph::{ReferenceGraph, RootSet};
use crate::snapshot::Snapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Default bound on classification passes
pub const DEFAULT_MAX_PASSES: usize = 32;

/// Outcome of running classification to a fixed point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClassificationReport {
    /// Passes executed, including the final pass that assigned nothing
    pub passes: usize,
    /// Tags committed across all passes
    pub assigned: usize,
    /// False when the pass bound was hit while passes were still assigning
    pub converged: bool,
    /// Used allocations whose bytes could not be read
    pub unreadable: usize,
}

/// Per-allocation facts recorded alongside the tag
#[derive(Debug, Clone, Default)]
pub struct Classifications {
    internal: Vec<u64>,
    labels: BTreeMap<AllocationIndex, String>,
}

impl Classifications {
    fn with_capacity(count: usize) -> Self {
        Self {
            internal: vec![0; count.div_ceil(64)],
            labels: BTreeMap::new(),
        }
    }

    fn mark_internal(&mut self, index: AllocationIndex) {
        let i = index as usize;
        self.internal[i / 64] |= 1 << (i % 64);
    }

    /// Whether the allocation was claimed as a container substructure
    pub fn is_internal(&self, index: AllocationIndex) -> bool {
        let i = index as usize;
        self.internal
            .get(i / 64)
            .is_some_and(|word| word & (1 << (i % 64)) != 0)
    }

    pub fn label(&self, index: AllocationIndex) -> Option<&str> {
        self.labels.get(&index).map(String::as_str)
    }

    pub fn internal_count(&self) -> usize {
        self.internal.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Recognizers in precedence order
///
/// Registration is only allowed before [`classify`](Self::classify) runs.
pub struct PatternRecognizerRegistry {
    recognizers: Vec<Box<dyn Recognizer>>,
    max_passes: usize,
    started: bool,
}

impl Default for PatternRecognizerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PASSES)
    }
}

impl PatternRecognizerRegistry {
    /// # Panics
    /// Panics if `max_passes` is zero.
    pub fn new(max_passes: usize) -> Self {
        assert!(max_passes > 0, "classification pass limit must be positive");
        Self {
            recognizers: Vec::new(),
            max_passes,
            started: false,
        }
    }

    /// # Panics
    /// Panics once classification has started.
    pub fn register(&mut self, recognizer: Box<dyn Recognizer>) {
        if self.started {
            panic!(
                "Recognizer \"{}\" registered after classification started",
                recognizer.name()
            );
        }
        self.recognizers.push(recognizer);
    }

    pub fn len(&self) -> usize {
        self.recognizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recognizers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recognizers.iter().map(|r| r.name())
    }

    /// Run classification passes until one assigns nothing or the bound is hit
    ///
    /// Each pass visits the untagged used allocations in index order and
    /// offers each to the recognizers in registration order. The first claim
    /// is committed at once, so later visits in the same pass already see it.
    /// Free allocations are never offered.
    pub fn classify(
        &mut self,
        snapshot: &dyn Snapshot,
        finder: &Finder,
        tags: &mut TagHolder,
        graph: &ReferenceGraph,
        roots: &RootSet,
    ) -> (Classifications, ClassificationReport) {
        self.started = true;
        tags.seal();

        let mut classifications = Classifications::with_capacity(finder.count());
        let mut report = ClassificationReport::default();
        if self.recognizers.is_empty() {
            report.converged = true;
            return (classifications, report);
        }

        let mut unreadable = vec![false; finder.count()];
        while report.passes < self.max_passes {
            report.passes += 1;
            let mut assigned = 0usize;

            for record in finder.records() {
                if !record.used || !tags.tag_of(record.index).is_untagged() {
                    continue;
                }
                let bytes = match snapshot.read(record.address, record.size) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        unreadable[record.index as usize] = true;
                        continue;
                    }
                };
                let candidate = Candidate {
                    index: record.index,
                    record,
                    bytes,
                };
                let claim = {
                    let ctx = ClassifyContext {
                        snapshot,
                        finder,
                        tags: &*tags,
                        graph,
                        roots,
                    };
                    self.recognizers
                        .iter()
                        .map(|r| r.classify(&candidate, &ctx))
                        .find(|c| *c != Classification::Unclaimed)
                };
                let Some(Classification::Claimed {
                    tag,
                    label,
                    internal,
                }) = claim
                else {
                    continue;
                };
                if tags.tag_allocation(record.index, tag) {
                    assigned += 1;
                    if internal {
                        classifications.mark_internal(record.index);
                    }
                    if let Some(label) = label {
                        classifications.labels.insert(record.index, label);
                    }
                }
            }

            debug!(pass = report.passes, assigned, "classification pass");
            report.assigned += assigned;
            if assigned == 0 {
                report.converged = true;
                break;
            }
        }

        report.unreadable = unreadable.iter().filter(|&&u| u).count();
        if !report.converged {
            warn!(
                passes = report.passes,
                assigned = report.assigned,
                "classification did not converge within the pass limit"
            );
        }
        (classifications, report)
    }
}
