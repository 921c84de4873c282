//! Disjoint accounting of the observed address space
//!
//! The partition starts from the mapped ranges of the snapshot (the observed
//! address space, each range with its [`PermissionClass`]) and accepts
//! claims attributing sub-ranges to a usage such as a thread stack, a module
//! image or a heap arena. Claims never overlap: a claim that would overlap an
//! existing one fails and changes nothing. Whatever is left over in a
//! permission class is reported as unclaimed, so for every class the claimed
//! ranges plus the unclaimed ranges cover the observed ranges exactly.

use crate::snapshot::{MappedRange, PermissionClass};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use thiserror::Error;
use tracing::debug;

/// What a claimed range is used for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UsageKind {
    Stack { thread: u32 },
    Module { name: String },
    Heap { arena: u64 },
    Other { label: String },
}

impl UsageKind {
    /// Coarse category used when summarizing claims
    pub fn category(&self) -> &str {
        match self {
            UsageKind::Stack { .. } => "stack",
            UsageKind::Module { .. } => "module",
            UsageKind::Heap { .. } => "heap arena",
            UsageKind::Other { label } => label,
        }
    }
}

impl fmt::Display for UsageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageKind::Stack { thread } => write!(f, "stack of thread {}", thread),
            UsageKind::Module { name } => write!(f, "image of module {}", name),
            UsageKind::Heap { arena } => write!(f, "heap arena at {:#x}", arena),
            UsageKind::Other { label } => f.write_str(label),
        }
    }
}

/// A claimed range `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeClaim {
    pub start: u64,
    pub end: u64,
    pub permissions: PermissionClass,
    pub usage: UsageKind,
}

impl RangeClaim {
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("empty range [{start:#x}, {end:#x})")]
    Empty { start: u64, end: u64 },

    #[error("range [{start:#x}, {end:#x}) overlaps existing claim [{existing_start:#x}, {existing_end:#x})")]
    Overlap {
        start: u64,
        end: u64,
        existing_start: u64,
        existing_end: u64,
    },

    #[error("range [{start:#x}, {end:#x}) is not entirely observed as {permissions}")]
    Unobserved {
        start: u64,
        end: u64,
        permissions: PermissionClass,
    },
}

/// Count and byte total over a set of ranges or allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Tally {
    pub count: usize,
    pub total_bytes: u64,
}

impl Tally {
    pub fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.total_bytes += bytes;
    }
}

/// Tally any set of ranges
pub fn tally<I>(ranges: I) -> Tally
where
    I: IntoIterator<Item = Range<u64>>,
{
    let mut tally = Tally::default();
    for range in ranges {
        tally.add(range.end - range.start);
    }
    tally
}

/// Summary row for claims of one usage category
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub usage: String,
    pub tally: Tally,
}

/// Disjoint claims over the observed address space
#[derive(Debug, Default)]
pub struct VirtualAddressPartition {
    observed: Vec<MappedRange>,
    claims: BTreeMap<u64, RangeClaim>,
}

impl VirtualAddressPartition {
    /// Partition over the given mapped ranges (sorted, non-overlapping)
    pub fn new(observed: &[MappedRange]) -> Self {
        let mut observed = observed.to_vec();
        observed.sort_unstable_by_key(|r| r.start);
        Self {
            observed,
            claims: BTreeMap::new(),
        }
    }

    /// Attribute `range` to `usage`; fails without side effects on overlap
    /// or when the range is not observed with the given permissions
    pub fn claim(
        &mut self,
        range: Range<u64>,
        permissions: PermissionClass,
        usage: UsageKind,
    ) -> Result<(), ClaimError> {
        let Range { start, end } = range;
        if start >= end {
            return Err(ClaimError::Empty { start, end });
        }
        if let Some(existing) = self.overlapping_claim(start, end) {
            return Err(ClaimError::Overlap {
                start,
                end,
                existing_start: existing.start,
                existing_end: existing.end,
            });
        }
        if !self.is_observed(start, end, permissions) {
            return Err(ClaimError::Unobserved {
                start,
                end,
                permissions,
            });
        }
        debug!(
            start = %format!("{:#x}", start),
            end = %format!("{:#x}", end),
            %usage,
            "range claimed"
        );
        self.claims.insert(
            start,
            RangeClaim {
                start,
                end,
                permissions,
                usage,
            },
        );
        Ok(())
    }

    /// Claim every observed piece of `range`, each with its own permissions
    ///
    /// Module images typically span several mappings (text, read-only data,
    /// writable data). Returns the failures; the successful pieces stay
    /// claimed.
    pub fn claim_mapped(&mut self, range: Range<u64>, usage: UsageKind) -> Vec<ClaimError> {
        let pieces: Vec<(Range<u64>, PermissionClass)> = self
            .observed
            .iter()
            .filter(|r| r.start < range.end && range.start < r.end)
            .map(|r| (r.start.max(range.start)..r.end.min(range.end), r.permissions))
            .collect();
        if pieces.is_empty() {
            return vec![ClaimError::Unobserved {
                start: range.start,
                end: range.end,
                permissions: PermissionClass::Inaccessible,
            }];
        }
        pieces
            .into_iter()
            .filter_map(|(piece, permissions)| {
                self.claim(piece, permissions, usage.clone()).err()
            })
            .collect()
    }

    fn overlapping_claim(&self, start: u64, end: u64) -> Option<&RangeClaim> {
        self.claims
            .range(..end)
            .next_back()
            .map(|(_, claim)| claim)
            .filter(|claim| claim.end > start)
    }

    /// True when `[start, end)` is covered by contiguous observed ranges of
    /// the given class
    fn is_observed(&self, start: u64, end: u64, permissions: PermissionClass) -> bool {
        let mut cursor = start;
        let idx = self.observed.partition_point(|r| r.end <= start);
        for range in &self.observed[idx..] {
            if range.start > cursor || range.permissions != permissions {
                return false;
            }
            cursor = range.end;
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// Claims of one permission class, in address order
    pub fn claimed_ranges(&self, permissions: PermissionClass) -> Vec<&RangeClaim> {
        self.claims
            .values()
            .filter(|c| c.permissions == permissions)
            .collect()
    }

    /// The claim covering `address`, if any
    pub fn claim_containing(&self, address: u64) -> Option<&RangeClaim> {
        self.claims
            .range(..=address)
            .next_back()
            .map(|(_, claim)| claim)
            .filter(|claim| claim.end > address)
    }

    pub fn all_claims(&self) -> impl Iterator<Item = &RangeClaim> {
        self.claims.values()
    }

    /// Observed ranges of one class not covered by any claim
    pub fn unclaimed(&self, permissions: PermissionClass) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        for observed in self.observed.iter().filter(|r| r.permissions == permissions) {
            let mut cursor = observed.start;
            for (_, claim) in self.claims.range(..observed.end) {
                if claim.end <= cursor {
                    continue;
                }
                if claim.start > cursor {
                    gaps.push(cursor..claim.start);
                }
                cursor = cursor.max(claim.end);
            }
            if cursor < observed.end {
                gaps.push(cursor..observed.end);
            }
        }
        gaps
    }

    pub fn observed(&self) -> &[MappedRange] {
        &self.observed
    }

    /// Claims of one class grouped by usage category, largest first
    pub fn summarize_claims(&self, permissions: PermissionClass) -> Vec<UsageSummary> {
        let mut by_usage: BTreeMap<&str, Tally> = BTreeMap::new();
        for claim in self.claimed_ranges(permissions) {
            by_usage
                .entry(claim.usage.category())
                .or_default()
                .add(claim.end - claim.start);
        }
        let mut rows: Vec<UsageSummary> = by_usage
            .into_iter()
            .map(|(usage, tally)| UsageSummary {
                usage: usage.to_string(),
                tally,
            })
            .collect();
        rows.sort_by(|a, b| b.tally.total_bytes.cmp(&a.tally.total_bytes));
        rows
    }
}
