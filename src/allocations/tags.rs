//! Write-once classification store
//!
//! One byte per allocation holds its [`TagIndex`]; `0` means untagged. The
//! single-byte storage caps the number of registered tags at [`MAX_TAGS`]
//! (indices `1..=255`), which keeps the store at one byte per allocation for
//! snapshots with millions of allocations. Exceeding the cap is a fatal
//! configuration error.
//!
//! The first successful [`TagHolder::tag_allocation`] for an allocation wins;
//! every later call for it is rejected without changing state.
//!
//! Invalid allocation indices, unregistered tags, duplicate tag names and tag
//! registration after the holder was sealed are contract violations and
//! panic.

use super::AllocationIndex;
use serde::Serialize;
use std::fmt;

/// Maximum number of registered tags (excluding "untagged")
pub const MAX_TAGS: usize = u8::MAX as usize;

/// Compact tag identifier; `TagIndex::UNTAGGED` is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct TagIndex(u8);

impl TagIndex {
    pub const UNTAGGED: TagIndex = TagIndex(0);

    pub fn is_untagged(self) -> bool {
        self == Self::UNTAGGED
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TagIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-allocation tag storage
#[derive(Debug)]
pub struct TagHolder {
    tags: Vec<u8>,
    names: Vec<String>,
    sealed: bool,
}

impl TagHolder {
    pub const UNTAGGED_NAME: &'static str = "untagged";

    pub fn new(num_allocations: usize) -> Self {
        Self {
            tags: vec![0; num_allocations],
            names: vec![Self::UNTAGGED_NAME.to_string()],
            sealed: false,
        }
    }

    /// Register a tag; the k-th registration returns index k
    ///
    /// # Panics
    /// Panics when the cap is reached, when `name` is already registered or
    /// when the holder is sealed.
    pub fn register_tag(&mut self, name: &str) -> TagIndex {
        if self.sealed {
            panic!("Tag \"{}\" registered after classification started", name);
        }
        if self.names.len() > MAX_TAGS {
            panic!(
                "{} tags reached - tag storage is one byte per allocation",
                MAX_TAGS
            );
        }
        if self.names.iter().any(|n| n == name) {
            panic!("Tag \"{}\" registered twice", name);
        }
        let index = TagIndex(self.names.len() as u8);
        self.names.push(name.to_string());
        index
    }

    /// Tag an allocation if it is still untagged
    ///
    /// Returns `true` when the tag was committed, `false` (with no change)
    /// when the allocation already carries a tag.
    ///
    /// # Panics
    /// Panics on an out-of-range allocation index, an unregistered tag or
    /// `TagIndex::UNTAGGED`.
    pub fn tag_allocation(&mut self, index: AllocationIndex, tag: TagIndex) -> bool {
        if tag.is_untagged() || tag.get() >= self.names.len() {
            panic!("Invalid allocation tag index {}", tag);
        }
        let slot = self.slot(index);
        if *slot == 0 {
            *slot = tag.0;
            true
        } else {
            false
        }
    }

    /// # Panics
    /// Panics on an out-of-range allocation index.
    pub fn tag_of(&self, index: AllocationIndex) -> TagIndex {
        match self.tags.get(index as usize) {
            Some(&tag) => TagIndex(tag),
            None => panic!("Invalid allocation index {}", index),
        }
    }

    fn slot(&mut self, index: AllocationIndex) -> &mut u8 {
        match self.tags.get_mut(index as usize) {
            Some(slot) => slot,
            None => panic!("Invalid allocation index {}", index),
        }
    }

    /// # Panics
    /// Panics on an unregistered tag.
    pub fn tag_name(&self, tag: TagIndex) -> &str {
        match self.names.get(tag.get()) {
            Some(name) => name,
            None => panic!("Invalid allocation tag index {}", tag),
        }
    }

    pub fn index_of(&self, name: &str) -> Option<TagIndex> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| TagIndex(i as u8))
    }

    /// Registered tags, excluding "untagged", in registration order
    pub fn registered(&self) -> impl Iterator<Item = (TagIndex, &str)> {
        self.names
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, n)| (TagIndex(i as u8), n.as_str()))
    }

    pub fn num_allocations(&self) -> usize {
        self.tags.len()
    }

    /// Forbid further registrations; called when classification starts
    pub fn seal(&mut self) {
        self.sealed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_tag_is_sequential() {
        let mut holder = TagHolder::new(4);
        assert_eq!(holder.register_tag("a").get(), 1);
        assert_eq!(holder.register_tag("b").get(), 2);
        assert_eq!(holder.register_tag("c").get(), 3);
        assert_eq!(holder.index_of("b"), Some(TagIndex(2)));
        assert_eq!(holder.tag_name(TagIndex(3)), "c");
        assert_eq!(holder.tag_name(TagIndex::UNTAGGED), "untagged");
    }

    #[test]
    fn test_tag_allocation_same_tag_twice() {
        let mut holder = TagHolder::new(2);
        let tag = holder.register_tag("node");
        assert!(holder.tag_allocation(1, tag));
        assert!(!holder.tag_allocation(1, tag));
        assert_eq!(holder.tag_of(1), tag);
        assert!(holder.tag_of(0).is_untagged());
    }

    #[test]
    fn test_tag_allocation_first_claim_wins() {
        let mut holder = TagHolder::new(1);
        let first = holder.register_tag("first");
        let second = holder.register_tag("second");
        assert!(holder.tag_allocation(0, first));
        assert!(!holder.tag_allocation(0, second));
        assert_eq!(holder.tag_of(0), first);
    }

    #[test]
    fn test_cap_allows_max_tags() {
        let mut holder = TagHolder::new(1);
        for i in 1..=MAX_TAGS {
            assert_eq!(holder.register_tag(&format!("tag{}", i)).get(), i);
        }
        assert_eq!(holder.registered().count(), MAX_TAGS);
    }

    #[test]
    #[should_panic(expected = "tags reached")]
    fn test_cap_exceeded_panics() {
        let mut holder = TagHolder::new(1);
        for i in 0..=MAX_TAGS {
            holder.register_tag(&format!("tag{}", i));
        }
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_name_panics() {
        let mut holder = TagHolder::new(1);
        holder.register_tag("dup");
        holder.register_tag("dup");
    }

    #[test]
    #[should_panic(expected = "after classification started")]
    fn test_register_after_seal_panics() {
        let mut holder = TagHolder::new(1);
        holder.seal();
        holder.register_tag("late");
    }

    #[test]
    #[should_panic(expected = "Invalid allocation index")]
    fn test_tag_out_of_range_allocation_panics() {
        let mut holder = TagHolder::new(1);
        let tag = holder.register_tag("t");
        holder.tag_allocation(5, tag);
    }

    #[test]
    #[should_panic(expected = "Invalid allocation tag index")]
    fn test_unregistered_tag_panics() {
        let mut holder = TagHolder::new(1);
        holder.tag_allocation(0, TagIndex(9));
    }

    #[test]
    #[should_panic(expected = "Invalid allocation index")]
    fn test_tag_of_out_of_range_panics() {
        let holder = TagHolder::new(0);
        holder.tag_of(0);
    }
}
