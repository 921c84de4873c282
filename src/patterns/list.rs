//! Doubly linked list nodes: `{next, prev, value...}`

use super::{Candidate, Classification, ClassifyContext, Recognizer};
use crate::allocations::{TagHolder, TagIndex};
use crate::snapshot::POINTER_SIZE;

/// Minimum node: two links and one value word
const MIN_NODE_SIZE: u64 = 3 * POINTER_SIZE;

pub struct ListNodeRecognizer {
    tag: TagIndex,
}

impl ListNodeRecognizer {
    pub const TAG: &'static str = "ListNode";

    pub fn new(tags: &mut TagHolder) -> Self {
        Self {
            tag: tags.register_tag(Self::TAG),
        }
    }
}

impl Recognizer for ListNodeRecognizer {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification {
        let node = candidate.record.address;
        if candidate.record.size < MIN_NODE_SIZE {
            return Classification::Unclaimed;
        }
        let (Some(next), Some(prev)) = (candidate.word(0), candidate.word(1)) else {
            return Classification::Unclaimed;
        };
        if next == 0 || prev == 0 || next == node {
            return Classification::Unclaimed;
        }
        let Some(next_prev) = next.checked_add(POINTER_SIZE) else {
            return Classification::Unclaimed;
        };
        // Both neighbours must link back: next->prev and prev->next
        if ctx.read_word(next_prev) != Some(node) || ctx.read_word(prev) != Some(node) {
            return Classification::Unclaimed;
        }
        Classification::internal(self.tag)
    }
}
