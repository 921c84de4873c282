//! Structural pattern recognition over allocations
//!
//! A [`Recognizer`] looks at one untagged allocation (its bytes, address and
//! size, plus read-only access to the index, the tags resolved so far and
//! the reference graph) and either leaves it alone or claims it with a tag.
//! The [`PatternRecognizerRegistry`] offers every untagged allocation to its
//! recognizers in registration order and repeats whole passes until nothing
//! new gets tagged.
//!
//! The standard recognizers identify the internal substructures of common
//! container implementations (vector bodies, list/tree/hash nodes, hash
//! bucket arrays, deque maps and pages) so that leak reports do not present
//! them as independently leaked objects.

mod deque;
mod hash;
mod list;
mod registry;
mod size_rule;
mod tree;
mod vector;

pub use deque::{DequeBlockRecognizer, DequeMapRecognizer};
pub use hash::{HashBucketsRecognizer, HashNodeRecognizer};
pub use list::ListNodeRecognizer;
pub use registry::{
    ClassificationReport, Classifications, PatternRecognizerRegistry, DEFAULT_MAX_PASSES,
};
pub use size_rule::{SizeRule, SizeRuleRecognizer};
pub use tree::TreeNodeRecognizer;
pub use vector::VectorBodyRecognizer;

use crate::allocations::{AllocationIndex, AllocationRecord, Finder, TagHolder, TagIndex};
use crate::graph::{Holder, Reference, ReferenceGraph, RootSet};
use crate::snapshot::{word_at, Snapshot, POINTER_SIZE};

/// Result of offering an allocation to a recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Unclaimed,
    Claimed {
        tag: TagIndex,
        label: Option<String>,
        /// Part of a container's implementation, never leaked on its own
        internal: bool,
    },
}

impl Classification {
    /// Claim as an internal substructure with no label
    pub fn internal(tag: TagIndex) -> Self {
        Classification::Claimed {
            tag,
            label: None,
            internal: true,
        }
    }
}

/// The allocation being classified
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub index: AllocationIndex,
    pub record: &'a AllocationRecord,
    pub bytes: &'a [u8],
}

impl Candidate<'_> {
    /// The `n`-th pointer-width word of the allocation
    pub fn word(&self, n: usize) -> Option<u64> {
        word_at(self.bytes, n * POINTER_SIZE as usize)
    }
}

/// Read-only view of the session handed to recognizers
pub struct ClassifyContext<'a> {
    pub(crate) snapshot: &'a dyn Snapshot,
    pub(crate) finder: &'a Finder,
    pub(crate) tags: &'a TagHolder,
    pub(crate) graph: &'a ReferenceGraph,
    pub(crate) roots: &'a RootSet,
}

impl<'a> ClassifyContext<'a> {
    pub fn finder(&self) -> &'a Finder {
        self.finder
    }

    pub fn graph(&self) -> &'a ReferenceGraph {
        self.graph
    }

    pub fn tag_of(&self, index: AllocationIndex) -> TagIndex {
        self.tags.tag_of(index)
    }

    /// Tag of a holder; roots are never tagged
    pub fn holder_tag(&self, holder: Holder) -> TagIndex {
        match holder {
            Holder::Allocation(index) => self.tags.tag_of(index),
            Holder::Root(_) => TagIndex::UNTAGGED,
        }
    }

    pub fn read_word(&self, address: u64) -> Option<u64> {
        self.snapshot.read_word(address)
    }

    /// The used allocation starting exactly at `address`
    pub fn used_allocation_at(&self, address: u64) -> Option<&'a AllocationRecord> {
        let index = self.finder.lookup_exact(address)?;
        let record = self.finder.record_at(index);
        record.used.then_some(record)
    }

    /// Everything that references allocation `index`
    pub fn referrers(&self, index: AllocationIndex) -> &'a [Reference] {
        self.graph.incoming(index)
    }

    /// Snapshot address of the word behind a reference (`None` for registers)
    pub fn reference_address(&self, reference: &Reference) -> Option<u64> {
        let base = match reference.holder {
            Holder::Allocation(index) => self.finder.record_at(index).address,
            Holder::Root(root) => self.roots.get(root).address()?,
        };
        Some(base + reference.offset)
    }

    /// Addresses of words that point exactly at the start of `record`
    pub fn exact_referrer_addresses(
        &self,
        record: &'a AllocationRecord,
    ) -> impl Iterator<Item = (Reference, u64)> + 'a {
        let snapshot = self.snapshot;
        let finder = self.finder;
        let roots = self.roots;
        self.graph.incoming(record.index).iter().filter_map(move |r| {
            let base = match r.holder {
                Holder::Allocation(index) => finder.record_at(index).address,
                Holder::Root(root) => roots.get(root).address()?,
            };
            let at = base + r.offset;
            (snapshot.read_word(at)? == record.address).then_some((*r, at))
        })
    }
}

/// A classifier for one structural pattern
pub trait Recognizer {
    fn name(&self) -> &str;

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification;
}

/// Register the container recognizers in their fixed precedence order
///
/// Order matters: a pass hands each allocation to the first recognizer that
/// claims it.
pub fn register_standard_recognizers(
    registry: &mut PatternRecognizerRegistry,
    tags: &mut TagHolder,
) {
    let deque_map = DequeMapRecognizer::new(tags);
    let deque_block = DequeBlockRecognizer::new(tags, deque_map.tag());
    let buckets = HashBucketsRecognizer::new(tags);
    let hash_node = HashNodeRecognizer::new(tags, buckets.tag());
    registry.register(Box::new(deque_map));
    registry.register(Box::new(deque_block));
    registry.register(Box::new(buckets));
    registry.register(Box::new(hash_node));
    registry.register(Box::new(TreeNodeRecognizer::new(tags)));
    registry.register(Box::new(VectorBodyRecognizer::new(tags)));
    registry.register(Box::new(ListNodeRecognizer::new(tags)));
}

/// Slack a malloc implementation may add past the requested size
pub(crate) const SIZE_SLACK: u64 = 2 * POINTER_SIZE;
