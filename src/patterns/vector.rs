//! Contiguous resizable-array bodies
//!
//! The control block holds three words `{begin, end, capacity_end}`. The body
//! is the allocation `begin` points at; `capacity_end` lands at or just short
//! of the allocation's limit.

use super::{Candidate, Classification, ClassifyContext, Recognizer, SIZE_SLACK};
use crate::allocations::{TagHolder, TagIndex};
use crate::snapshot::POINTER_SIZE;

pub struct VectorBodyRecognizer {
    tag: TagIndex,
}

impl VectorBodyRecognizer {
    pub const TAG: &'static str = "VectorBody";

    pub fn new(tags: &mut TagHolder) -> Self {
        Self {
            tag: tags.register_tag(Self::TAG),
        }
    }
}

impl Recognizer for VectorBodyRecognizer {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn classify(&self, candidate: &Candidate<'_>, ctx: &ClassifyContext<'_>) -> Classification {
        let body = candidate.record;
        let matched = ctx.exact_referrer_addresses(body).any(|(_, at)| {
            let (Some(end), Some(capacity)) = (
                ctx.read_word(at + POINTER_SIZE),
                ctx.read_word(at + 2 * POINTER_SIZE),
            ) else {
                return false;
            };
            body.address <= end
                && end <= capacity
                && capacity > body.address
                && capacity <= body.limit()
                && body.limit() - capacity < SIZE_SLACK
        });
        if matched {
            Classification::internal(self.tag)
        } else {
            Classification::Unclaimed
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::patterns::testing::{tag_name, Fixture, STATIC};

    #[test]
    fn test_body_behind_heap_control_block() {
        let mut fixture = Fixture::new(&[24, 32]);
        let (control, body) = (fixture.addr(0), fixture.addr(1));
        fixture.write(control, &[body, body + 16, body + 32]);
        let tags = fixture.classify_standard();
        assert_eq!(tag_name(&tags, 1), "VectorBody");
        assert_eq!(tag_name(&tags, 0), "untagged");
    }

    #[test]
    fn test_body_behind_static_control_block() {
        let mut fixture = Fixture::new(&[64]);
        let body = fixture.addr(0);
        fixture.write(STATIC + 0x20, &[body, body, body + 64]);
        let tags = fixture.classify_standard();
        assert_eq!(tag_name(&tags, 0), "VectorBody");
    }

    #[test]
    fn test_capacity_past_limit_rejected() {
        let mut fixture = Fixture::new(&[24, 32]);
        let (control, body) = (fixture.addr(0), fixture.addr(1));
        fixture.write(control, &[body, body + 16, body + 48]);
        let tags = fixture.classify_standard();
        assert_eq!(tag_name(&tags, 1), "untagged");
    }

    #[test]
    fn test_capacity_far_short_of_limit_rejected() {
        let mut fixture = Fixture::new(&[24, 64]);
        let (control, body) = (fixture.addr(0), fixture.addr(1));
        fixture.write(control, &[body, body + 8, body + 16]);
        let tags = fixture.classify_standard();
        assert_eq!(tag_name(&tags, 1), "untagged");
    }
}
