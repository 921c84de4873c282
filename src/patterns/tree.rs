//! Red-black tree nodes
//!
//! ```text
//! +0   color (0 red / 1 black)
//! +8   parent
//! +16  left
//! +24  right
//! +32  value...
//! ```
//!
//! A node is accepted when its links are mutually consistent: each child
//! names it as parent, and the parent names it as a child. The root's parent
//! is the tree header embedded in the container, whose parent slot points
//! back at the root.

use super::{Candidate, Classification, ClassifyContext, Recognizer};
use crate::allocations::{TagHolder, TagIndex};
use crate::snapshot::POINTER_SIZE;

const PARENT: u64 = POINTER_SIZE;
const LEFT: u64 = 2 * POINTER_SIZE;
const RIGHT: u64 = 3 * POINTER_SIZE;
const MIN_NODE_SIZE: u64 = 5 * POINTER_SIZE;

pub struct TreeNodeRecognizer {
    tag: TagIndex,
}

impl TreeNodeRecognizer {
    pub const TAG: &'static str = "TreeNode";

    pub fn new(tags: &mut TagHolder) -> Self {
        Self {
            tag: tags.register_tag(Self::TAG),
        }
    }

    fn links_consistent(candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Option<bool> {
        let node = candidate.record.address;
        let color = candidate.word(0)?;
        let parent = candidate.word(1)?;
        if color > 1 || parent == 0 {
            return Some(false);
        }
        for child in [candidate.word(2)?, candidate.word(3)?] {
            if child == 0 {
                continue;
            }
            if ctx.used_allocation_at(child).is_none()
                || ctx.read_word(child.checked_add(PARENT)?) != Some(node)
            {
                return Some(false);
            }
        }
        let link = |offset: u64| parent.checked_add(offset).and_then(|at| ctx.read_word(at));
        let named_by_parent = link(LEFT) == Some(node)
            || link(RIGHT) == Some(node)
            || link(PARENT) == Some(node);
        Some(named_by_parent)
    }
}

impl Recognizer for TreeNodeRecognizer {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification {
        if candidate.record.size < MIN_NODE_SIZE {
            return Classification::Unclaimed;
        }
        match Self::links_consistent(candidate, ctx) {
            Some(true) => Classification::internal(self.tag),
            _ => Classification::Unclaimed,
        }
    }
}
