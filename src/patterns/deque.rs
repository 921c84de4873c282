//! Deque map arrays and the pages they index
//!
//! ```text
//! +0   map          -> array of page pointers
//! +8   map_size     (slots, at least 8)
//! +16  start  {cur, first, last, node}
//! +48  finish {cur, first, last, node}
//! ```
//!
//! `start.node` and `finish.node` point into the map, and `*start.node` is
//! the page `start.first` points at. Pages are recognized once the map that
//! holds them has been tagged.

use super::{Candidate, Classification, ClassifyContext, Recognizer, SIZE_SLACK};
use crate::allocations::{TagHolder, TagIndex};
use crate::graph::Holder;
use crate::snapshot::POINTER_SIZE;

const MAP_SIZE: u64 = POINTER_SIZE;
const START_FIRST: u64 = 3 * POINTER_SIZE;
const START_NODE: u64 = 5 * POINTER_SIZE;
const FINISH_NODE: u64 = 9 * POINTER_SIZE;
const MIN_MAP_SLOTS: u64 = 8;

pub struct DequeMapRecognizer {
    tag: TagIndex,
}

impl DequeMapRecognizer {
    pub const TAG: &'static str = "DequeMap";

    pub fn new(tags: &mut TagHolder) -> Self {
        Self {
            tag: tags.register_tag(Self::TAG),
        }
    }

    pub fn tag(&self) -> TagIndex {
        self.tag
    }

    fn matches_control(
        candidate: &Candidate<'_>,
        ctx: &ClassifyContext<'_>,
        control: u64,
    ) -> Option<bool> {
        let map = candidate.record;
        let slots = ctx.read_word(control + MAP_SIZE)?;
        if slots < MIN_MAP_SLOTS || slots > map.size / POINTER_SIZE {
            return Some(false);
        }
        if map.size >= slots * POINTER_SIZE + SIZE_SLACK {
            return Some(false);
        }
        let start_node = ctx.read_word(control + START_NODE)?;
        let finish_node = ctx.read_word(control + FINISH_NODE)?;
        let map_end = map.address + slots * POINTER_SIZE;
        if start_node < map.address || start_node > finish_node || finish_node >= map_end {
            return Some(false);
        }
        let first_page = ctx.read_word(start_node)?;
        Some(first_page != 0 && ctx.read_word(control + START_FIRST)? == first_page)
    }
}

impl Recognizer for DequeMapRecognizer {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification {
        let matched = ctx
            .exact_referrer_addresses(candidate.record)
            .any(|(_, control)| Self::matches_control(candidate, ctx, control) == Some(true));
        if matched {
            Classification::internal(self.tag)
        } else {
            Classification::Unclaimed
        }
    }
}

pub struct DequeBlockRecognizer {
    tag: TagIndex,
    map: TagIndex,
}

impl DequeBlockRecognizer {
    pub const TAG: &'static str = "DequeBlock";

    /// `map` is the tag the map recognizer assigns
    pub fn new(tags: &mut TagHolder, map: TagIndex) -> Self {
        Self {
            tag: tags.register_tag(Self::TAG),
            map,
        }
    }
}

impl Recognizer for DequeBlockRecognizer {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification {
        let matched = ctx
            .exact_referrer_addresses(candidate.record)
            .any(|(reference, _)| {
                matches!(reference.holder, Holder::Allocation(_))
                    && ctx.holder_tag(reference.holder) == self.map
            });
        if matched {
            Classification::internal(self.tag)
        } else {
            Classification::Unclaimed
        }
    }
}
