//! Read-only query surface of a session
//!
//! Every view here is derived from the index, the tags, the classification
//! flags, the reference graph and the partition. Nothing mutates session
//! state, so repeated queries return identical answers.

use crate::allocations::{AllocationIndex, AllocationRecord, ArenaStats, SourceReport, TagIndex};
use crate::graph::{Explanation, Holder, Root, RootContents, RootKind};
use crate::partition::{self, RangeClaim, Tally, UsageKind, UsageSummary};
use crate::session::Session;
use crate::snapshot::{MappedRange, PermissionClass};
use clap::ValueEnum;
use fnv::FnvHashMap;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::ops::Range;

/// One allocation with its classification resolved
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocationView<'a> {
    #[serde(flatten)]
    pub record: &'a AllocationRecord,
    pub tag: TagIndex,
    pub tag_name: &'a str,
    pub internal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<&'a str>,
}

/// Named allocation sets, one predicate each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationSet {
    /// Every allocation, used or free
    Allocations,
    Used,
    Free,
    /// Used and reachable from a root
    Anchored,
    /// Used and unreachable from every root
    Leaked,
    /// Leaked, not internal, and not referenced by any other leaked allocation
    Unreferenced,
    Tagged,
    Untagged,
    /// Claimed as a container substructure
    Internal,
}

impl AllocationSet {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationSet::Allocations => "allocations",
            AllocationSet::Used => "used",
            AllocationSet::Free => "free",
            AllocationSet::Anchored => "anchored",
            AllocationSet::Leaked => "leaked",
            AllocationSet::Unreferenced => "unreferenced",
            AllocationSet::Tagged => "tagged",
            AllocationSet::Untagged => "untagged",
            AllocationSet::Internal => "internal",
        }
    }
}

impl fmt::Display for AllocationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key for [`Session::summarize_by`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    Tag,
    Size,
    Source,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRow {
    pub key: String,
    pub count: usize,
    pub bytes: u64,
}

/// What an address belongs to, most specific owner first
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddressDescription<'a> {
    /// Inside an allocation, used or free
    Allocation {
        allocation: AllocationView<'a>,
        offset: u64,
    },
    /// Inside a thread stack or a module image
    Root { root: &'a Root, offset: u64 },
    /// Inside a claimed range with no finer owner, such as arena slack
    Claimed { claim: &'a RangeClaim },
    /// Mapped but attributed to nothing
    Unclaimed { range: MappedRange },
    Unmapped,
}

/// One thread stack and the references it holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackReport {
    pub thread: u32,
    pub start: u64,
    pub end: u64,
    /// Pointer words on the stack that land in used allocations
    pub references: usize,
    /// Distinct allocations those words point into
    pub allocations: usize,
}

/// One loaded module and the claimed pieces of its image
#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport<'a> {
    pub name: &'a str,
    pub start: u64,
    pub end: u64,
    pub mappings: Vec<&'a RangeClaim>,
}

/// Size and tag-name constraints applied on top of a set
#[derive(Debug, Clone, Default)]
pub struct AllocationFilter {
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub tag: Option<Regex>,
}

impl AllocationFilter {
    pub fn matches(&self, view: &AllocationView<'_>) -> bool {
        let size = view.record.size;
        self.min_size.map_or(true, |min| size >= min)
            && self.max_size.map_or(true, |max| size <= max)
            && self
                .tag
                .as_ref()
                .map_or(true, |re| re.is_match(view.tag_name))
    }
}

impl Session {
    pub fn lookup_exact(&self, address: u64) -> Option<AllocationIndex> {
        self.finder.lookup_exact(address)
    }

    pub fn lookup_containing(&self, address: u64) -> Option<AllocationIndex> {
        self.finder.lookup_containing(address)
    }

    /// # Panics
    /// Panics if `index` is out of range.
    pub fn tag_of(&self, index: AllocationIndex) -> TagIndex {
        self.tags.tag_of(index)
    }

    /// # Panics
    /// Panics if `index` is out of range.
    pub fn view(&self, index: AllocationIndex) -> AllocationView<'_> {
        let record = self.finder.record_at(index);
        let tag = self.tags.tag_of(index);
        AllocationView {
            record,
            tag,
            tag_name: self.tags.tag_name(tag),
            internal: self.classifications.is_internal(index),
            label: self.classifications.label(index),
        }
    }

    pub fn views(&self) -> impl Iterator<Item = AllocationView<'_>> {
        (0..self.finder.count()).map(|i| self.view(i as AllocationIndex))
    }

    pub fn is_reachable(&self, index: AllocationIndex) -> bool {
        self.reachability().is_reachable(index)
    }

    pub fn is_leaked(&self, index: AllocationIndex) -> bool {
        self.finder.record_at(index).used && !self.is_reachable(index)
    }

    pub fn is_unreferenced(&self, index: AllocationIndex) -> bool {
        self.is_leaked(index)
            && !self.classifications.is_internal(index)
            && !self.graph.incoming(index).iter().any(|r| match r.holder {
                Holder::Allocation(from) => from != index && self.is_leaked(from),
                Holder::Root(_) => false,
            })
    }

    pub fn in_set(&self, set: AllocationSet, index: AllocationIndex) -> bool {
        let record = self.finder.record_at(index);
        match set {
            AllocationSet::Allocations => true,
            AllocationSet::Used => record.used,
            AllocationSet::Free => !record.used,
            AllocationSet::Anchored => record.used && self.is_reachable(index),
            AllocationSet::Leaked => self.is_leaked(index),
            AllocationSet::Unreferenced => self.is_unreferenced(index),
            AllocationSet::Tagged => !self.tags.tag_of(index).is_untagged(),
            AllocationSet::Untagged => self.tags.tag_of(index).is_untagged(),
            AllocationSet::Internal => self.classifications.is_internal(index),
        }
    }

    /// Allocations in `set` passing `filter`
    pub fn select<'a>(
        &'a self,
        set: AllocationSet,
        filter: &'a AllocationFilter,
    ) -> impl Fn(&AllocationView<'_>) -> bool + 'a {
        move |view: &AllocationView<'_>| {
            self.in_set(set, view.record.index) && filter.matches(view)
        }
    }

    pub fn count_matching<P>(&self, predicate: P) -> Tally
    where
        P: Fn(&AllocationView<'_>) -> bool,
    {
        let mut tally = Tally::default();
        for view in self.views().filter(|v| predicate(v)) {
            tally.add(view.record.size);
        }
        tally
    }

    pub fn list_matching<P>(&self, predicate: P) -> Vec<AllocationView<'_>>
    where
        P: Fn(&AllocationView<'_>) -> bool,
    {
        self.views().filter(|v| predicate(v)).collect()
    }

    /// Group matching allocations; rows by byte total descending, then key
    pub fn summarize_by<P>(&self, grouping: Grouping, predicate: P) -> Vec<SummaryRow>
    where
        P: Fn(&AllocationView<'_>) -> bool,
    {
        let mut groups: FnvHashMap<String, (usize, u64)> = FnvHashMap::default();
        for view in self.views().filter(|v| predicate(v)) {
            let key = match grouping {
                Grouping::Tag => view.tag_name.to_string(),
                Grouping::Size => view.record.size.to_string(),
                Grouping::Source => self.finder.source_reports()[view.record.source.0 as usize]
                    .name
                    .clone(),
            };
            let entry = groups.entry(key).or_default();
            entry.0 += 1;
            entry.1 += view.record.size;
        }
        let mut rows: Vec<SummaryRow> = groups
            .into_iter()
            .map(|(key, (count, bytes))| SummaryRow { key, count, bytes })
            .collect();
        rows.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.key.cmp(&b.key)));
        rows
    }

    /// Shortest reference path from a root to allocation `index`
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn explain(&self, index: AllocationIndex) -> Explanation {
        self.reachability().explain(index)
    }

    /// Explain the allocation holding `address`, if any
    pub fn explain_address(&self, address: u64) -> Option<(AllocationIndex, Explanation)> {
        let index = self.finder.lookup_containing(address)?;
        Some((index, self.explain(index)))
    }

    pub fn claimed_ranges(&self, permissions: PermissionClass) -> Vec<&RangeClaim> {
        self.partition.claimed_ranges(permissions)
    }

    pub fn unclaimed(&self, permissions: PermissionClass) -> Vec<Range<u64>> {
        self.partition.unclaimed(permissions)
    }

    pub fn summarize_claims(&self, permissions: PermissionClass) -> Vec<UsageSummary> {
        self.partition.summarize_claims(permissions)
    }

    pub fn tally<I>(&self, ranges: I) -> Tally
    where
        I: IntoIterator<Item = Range<u64>>,
    {
        partition::tally(ranges)
    }

    pub fn arenas(&self) -> impl Iterator<Item = &ArenaStats> {
        self.finder.arenas().values()
    }

    pub fn source_reports(&self) -> &[SourceReport] {
        self.finder.source_reports()
    }

    /// True when no allocator was recognized, so allocation queries have
    /// nothing to answer from
    pub fn allocations_disabled(&self) -> bool {
        self.finder.is_disabled()
    }

    /// Resolve `address` to an allocation, a stack or module, a claimed
    /// range or an unclaimed mapping, in that order
    pub fn describe_address(&self, address: u64) -> AddressDescription<'_> {
        if let Some(index) = self.finder.lookup_containing(address) {
            let allocation = self.view(index);
            return AddressDescription::Allocation {
                allocation,
                offset: address - allocation.record.address,
            };
        }
        let Some(mapped) = self.partition.observed().iter().find(|r| r.contains(address)) else {
            return AddressDescription::Unmapped;
        };
        let root = self.roots.iter().find_map(|root| match root.contents {
            RootContents::Range { start, end } if start <= address && address < end => {
                Some((root, address - start))
            }
            _ => None,
        });
        if let Some((root, offset)) = root {
            return AddressDescription::Root { root, offset };
        }
        if let Some(claim) = self.partition.claim_containing(address) {
            return AddressDescription::Claimed { claim };
        }
        let gap = self
            .unclaimed(mapped.permissions)
            .into_iter()
            .find(|gap| gap.contains(&address))
            .unwrap_or(mapped.start..mapped.end);
        AddressDescription::Unclaimed {
            range: MappedRange {
                start: gap.start,
                end: gap.end,
                permissions: mapped.permissions,
            },
        }
    }

    /// Thread stacks in root order
    pub fn stacks(&self) -> Vec<StackReport> {
        self.roots
            .iter()
            .filter_map(|root| match (&root.kind, root.contents) {
                (RootKind::Stack { thread }, RootContents::Range { start, end }) => {
                    let edges = self.graph.root_edges(root.id);
                    // Edges are sorted by target
                    let mut targets: Vec<AllocationIndex> = edges.iter().map(|e| e.target).collect();
                    targets.dedup();
                    Some(StackReport {
                        thread: *thread,
                        start,
                        end,
                        references: edges.len(),
                        allocations: targets.len(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Loaded modules in root order
    pub fn modules(&self) -> Vec<ModuleReport<'_>> {
        self.roots
            .iter()
            .filter_map(|root| match (&root.kind, root.contents) {
                (RootKind::Module { name }, RootContents::Range { start, end }) => {
                    let mappings = self
                        .partition
                        .all_claims()
                        .filter(|c| c.start < end && start < c.end)
                        .filter(|c| matches!(&c.usage, UsageKind::Module { name: n } if n == name))
                        .collect();
                    Some(ModuleReport {
                        name: name.as_str(),
                        start,
                        end,
                        mappings,
                    })
                }
                _ => None,
            })
            .collect()
    }
}
