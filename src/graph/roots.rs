//! Process roots: the non-allocation origins of references
//!
//! Module images (static data), thread stacks and captured registers may all
//! hold pointers into the heap. Stack and module roots are byte ranges in the
//! snapshot; a register root is a single captured word.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense root identifier, assigned in insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RootId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RootKind {
    Module { name: String },
    Stack { thread: u32 },
    Register { thread: u32, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootContents {
    /// Bytes `[start, end)` of the snapshot
    Range { start: u64, end: u64 },
    /// A captured register value
    Value(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Root {
    pub id: RootId,
    pub kind: RootKind,
    pub contents: RootContents,
}

impl Root {
    /// Snapshot address of the root's first byte (`None` for registers)
    pub fn address(&self) -> Option<u64> {
        match self.contents {
            RootContents::Range { start, .. } => Some(start),
            RootContents::Value(_) => None,
        }
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RootKind::Module { name } => write!(f, "module {}", name),
            RootKind::Stack { thread } => write!(f, "stack of thread {}", thread),
            RootKind::Register { thread, name } => {
                write!(f, "register {} of thread {}", name, thread)
            }
        }
    }
}

/// A loaded module's image `[base, limit)`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleRange {
    pub name: String,
    pub base: u64,
    pub limit: u64,
}

/// A thread's stack `[base, limit)`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreadStack {
    pub thread: u32,
    pub base: u64,
    pub limit: u64,
}

/// A register value captured with the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterValue {
    pub thread: u32,
    pub name: String,
    pub value: u64,
}

/// OS/format-specific discovery of modules, stacks and registers
pub trait RootProvider {
    fn modules(&self) -> Vec<ModuleRange>;
    fn thread_stacks(&self) -> Vec<ThreadStack>;
    fn registers(&self) -> Vec<RegisterValue>;
}

/// Ordered set of roots for one session
#[derive(Debug, Clone, Default)]
pub struct RootSet {
    roots: Vec<Root>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modules first, then stacks, then registers, each in provider order
    pub fn from_provider(provider: &dyn RootProvider) -> Self {
        let mut set = Self::new();
        for module in provider.modules() {
            set.push(
                RootKind::Module { name: module.name },
                RootContents::Range {
                    start: module.base,
                    end: module.limit,
                },
            );
        }
        for stack in provider.thread_stacks() {
            set.push(
                RootKind::Stack {
                    thread: stack.thread,
                },
                RootContents::Range {
                    start: stack.base,
                    end: stack.limit,
                },
            );
        }
        for register in provider.registers() {
            set.push(
                RootKind::Register {
                    thread: register.thread,
                    name: register.name,
                },
                RootContents::Value(register.value),
            );
        }
        set
    }

    pub fn push(&mut self, kind: RootKind, contents: RootContents) -> RootId {
        let id = RootId(self.roots.len() as u32);
        self.roots.push(Root { id, kind, contents });
        id
    }

    /// # Panics
    /// Panics if `id` was not issued by this set.
    pub fn get(&self, id: RootId) -> &Root {
        match self.roots.get(id.0 as usize) {
            Some(root) => root,
            None => panic!("Invalid root id {}", id.0),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Root> {
        self.roots.iter()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider;

    impl RootProvider for FixedProvider {
        fn modules(&self) -> Vec<ModuleRange> {
            vec![ModuleRange {
                name: "app".to_string(),
                base: 0x400000,
                limit: 0x401000,
            }]
        }

        fn thread_stacks(&self) -> Vec<ThreadStack> {
            vec![ThreadStack {
                thread: 1,
                base: 0x7ff000,
                limit: 0x800000,
            }]
        }

        fn registers(&self) -> Vec<RegisterValue> {
            vec![RegisterValue {
                thread: 1,
                name: "rax".to_string(),
                value: 0x1234,
            }]
        }
    }

    #[test]
    fn test_from_provider_orders_roots() {
        let set = RootSet::from_provider(&FixedProvider);
        assert_eq!(set.len(), 3);
        let kinds: Vec<String> = set.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            kinds,
            vec!["module app", "stack of thread 1", "register rax of thread 1"]
        );
        assert_eq!(set.get(RootId(2)).address(), None);
        assert_eq!(set.get(RootId(1)).address(), Some(0x7ff000));
    }

    #[test]
    #[should_panic(expected = "Invalid root id")]
    fn test_unknown_root_panics() {
        RootSet::new().get(RootId(0));
    }
}
