//! Hash table bucket arrays and nodes
//!
//! The control block starts with:
//!
//! ```text
//! +0   buckets          -> bucket array
//! +8   bucket_count
//! +16  before_begin     -> first node (the bucket of the first node points here)
//! +24  element_count
//! ```
//!
//! Nodes are singly linked through their first word. A bucket slot holds the
//! node *preceding* the bucket's first node, or the address of
//! `before_begin` for the bucket holding the very first node.

use super::{Candidate, Classification, ClassifyContext, Recognizer, SIZE_SLACK};
use crate::allocations::{TagHolder, TagIndex};
use crate::graph::Holder;
use crate::snapshot::POINTER_SIZE;

const BUCKET_COUNT: u64 = POINTER_SIZE;
const BEFORE_BEGIN: u64 = 2 * POINTER_SIZE;
const ELEMENT_COUNT: u64 = 3 * POINTER_SIZE;

pub struct HashBucketsRecognizer {
    tag: TagIndex,
}

impl HashBucketsRecognizer {
    pub const TAG: &'static str = "HashBuckets";

    pub fn new(tags: &mut TagHolder) -> Self {
        Self {
            tag: tags.register_tag(Self::TAG),
        }
    }

    pub fn tag(&self) -> TagIndex {
        self.tag
    }

    /// Does the control block at `control` own `candidate` as its buckets?
    fn matches_control(
        candidate: &Candidate<'_>,
        ctx: &ClassifyContext<'_>,
        control: u64,
    ) -> bool {
        let words = (
            ctx.read_word(control + BUCKET_COUNT),
            ctx.read_word(control + BEFORE_BEGIN),
            ctx.read_word(control + ELEMENT_COUNT),
        );
        let (Some(bucket_count), Some(first_node), Some(elements)) = words else {
            return false;
        };
        let size = candidate.record.size;
        if bucket_count < 2 || bucket_count > size / POINTER_SIZE {
            return false;
        }
        if size >= bucket_count * POINTER_SIZE + SIZE_SLACK {
            return false;
        }
        if elements == 0 || ctx.used_allocation_at(first_node).is_none() {
            return false;
        }

        let anchor = control + BEFORE_BEGIN;
        let mut anchored = 0;
        for slot in 0..bucket_count as usize {
            match candidate.word(slot) {
                Some(0) => {}
                Some(value) if value == anchor => anchored += 1,
                Some(value) if ctx.used_allocation_at(value).is_some() => {}
                _ => return false,
            }
        }
        anchored == 1
    }
}

impl Recognizer for HashBucketsRecognizer {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification {
        let matched = ctx
            .exact_referrer_addresses(candidate.record)
            .any(|(_, control)| Self::matches_control(candidate, ctx, control));
        if matched {
            Classification::internal(self.tag)
        } else {
            Classification::Unclaimed
        }
    }
}

pub struct HashNodeRecognizer {
    tag: TagIndex,
    buckets: TagIndex,
}

impl HashNodeRecognizer {
    pub const TAG: &'static str = "HashNode";

    /// `buckets` is the tag the bucket array recognizer assigns
    pub fn new(tags: &mut TagHolder, buckets: TagIndex) -> Self {
        Self {
            tag: tags.register_tag(Self::TAG),
            buckets,
        }
    }
}

impl Recognizer for HashNodeRecognizer {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification {
        if candidate.record.size < 2 * POINTER_SIZE {
            return Classification::Unclaimed;
        }
        let matched = ctx
            .exact_referrer_addresses(candidate.record)
            .any(|(reference, at)| {
                let holder_tag = ctx.holder_tag(reference.holder);
                if holder_tag == self.buckets {
                    return true;
                }
                if holder_tag == self.tag && reference.offset == 0 {
                    return true;
                }
                if matches!(reference.holder, Holder::Allocation(_)) && reference.offset == 0 {
                    return false;
                }
                // before_begin slot of a control block whose buckets are known
                at.checked_sub(BEFORE_BEGIN)
                    .and_then(|control| ctx.read_word(control))
                    .and_then(|buckets| ctx.used_allocation_at(buckets))
                    .is_some_and(|record| ctx.tag_of(record.index) == self.buckets)
            });
        if matched {
            Classification::internal(self.tag)
        } else {
            Classification::Unclaimed
        }
    }
}
