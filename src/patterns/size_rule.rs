//! Configured size-based classification

use super::{Candidate, Classification, ClassifyContext, Recognizer};
use crate::allocations::{TagHolder, TagIndex};
use serde::{Deserialize, Serialize};

/// Tag every used allocation of exactly `size` bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRule {
    pub tag: String,
    pub size: u64,
    #[serde(default)]
    pub internal: bool,
}

pub struct SizeRuleRecognizer {
    rule: SizeRule,
    tag: TagIndex,
}

impl SizeRuleRecognizer {
    pub fn new(tags: &mut TagHolder, rule: SizeRule) -> Self {
        let tag = tags.register_tag(&rule.tag);
        Self { rule, tag }
    }
}

impl Recognizer for SizeRuleRecognizer {
    fn name(&self) -> &str {
        &self.rule.tag
    }

    fn classify(&self, candidate: &Candidate<'_>, _: &ClassifyContext<'_>) -> Classification {
        if candidate.record.size != self.rule.size {
            return Classification::Unclaimed;
        }
        Classification::Claimed {
            tag: self.tag,
            label: None,
            internal: self.rule.internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::testing::{tag_name, Fixture};

    #[test]
    fn test_rule_tags_matching_size_only() {
        let fixture = Fixture::new(&[16, 32, 16]);
        let (tags, report) = fixture.classify(|registry, tags| {
            let rule = SizeRule {
                tag: "ListNode".to_string(),
                size: 32,
                internal: false,
            };
            registry.register(Box::new(SizeRuleRecognizer::new(tags, rule)));
        });
        assert_eq!(tag_name(&tags, 0), "untagged");
        assert_eq!(tag_name(&tags, 1), "ListNode");
        assert_eq!(tag_name(&tags, 2), "untagged");
        assert_eq!(report.assigned, 1);
    }

    #[test]
    fn test_rule_deserializes_with_default_internal() {
        let rule: SizeRule = toml::from_str("tag = \"Widget\"\nsize = 48\n").unwrap();
        assert_eq!(rule.size, 48);
        assert!(!rule.internal);
    }
}
