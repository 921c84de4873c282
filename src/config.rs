//! Session configuration loaded from TOML
//!
//! A session file names the snapshot, the allocator metadata to index, the
//! process roots and the classification settings:
//!
//! ```toml
//! [snapshot]
//! core = "core.1234"
//!
//! [[heaps]]
//! name = "main arena"
//! base = 0x555555559000
//! limit = 0x55555557a000
//!
//! [[stacks]]
//! thread = 1
//! base = 0x7ffffffde000
//! limit = 0x7ffffffff000
//!
//! [classification]
//! max_passes = 32
//!
//! [[classification.size_rules]]
//! tag = "Session"
//! size = 200
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::allocations::{HeapRegion, RawRecord, TagHolder, MAX_TAGS};
use crate::graph::{ModuleRange, RegisterValue, RootProvider, ThreadStack};
use crate::patterns::{
    DequeBlockRecognizer, DequeMapRecognizer, HashBucketsRecognizer, HashNodeRecognizer,
    ListNodeRecognizer, SizeRule, TreeNodeRecognizer, VectorBodyRecognizer, DEFAULT_MAX_PASSES,
};
use crate::snapshot::{CoreFile, PermissionClass, RawDumpImage, RawSegment, Snapshot};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Tags registered by the standard container recognizers
pub const STANDARD_TAGS: [&str; 7] = [
    DequeMapRecognizer::TAG,
    DequeBlockRecognizer::TAG,
    HashBucketsRecognizer::TAG,
    HashNodeRecognizer::TAG,
    TreeNodeRecognizer::TAG,
    VectorBodyRecognizer::TAG,
    ListNodeRecognizer::TAG,
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub heaps: Vec<HeapConfig>,
    #[serde(default)]
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub stacks: Vec<ThreadStack>,
    #[serde(default)]
    pub modules: Vec<ModuleRange>,
    #[serde(default)]
    pub registers: Vec<RegisterValue>,
    #[serde(default)]
    pub classification: ClassificationConfig,
}

/// Where the snapshot bytes come from: one core file or raw segment dumps
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    pub core: Option<PathBuf>,
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentConfig {
    pub address: u64,
    pub file: PathBuf,
    /// `rwx` triple such as `"r-x"`
    #[serde(default = "default_permissions")]
    pub permissions: String,
}

fn default_permissions() -> String {
    "rw-".to_string()
}

/// A chunked heap region walked as its own allocation source
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeapConfig {
    pub name: String,
    pub base: u64,
    pub limit: u64,
    #[serde(default)]
    pub max_size: u64,
}

impl HeapConfig {
    pub fn region(&self) -> HeapRegion {
        HeapRegion {
            base: self.base,
            limit: self.limit,
            max_size: self.max_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationConfig {
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
    #[serde(default = "default_true")]
    pub default_recognizers: bool,
    #[serde(default)]
    pub size_rules: Vec<SizeRule>,
}

fn default_max_passes() -> usize {
    DEFAULT_MAX_PASSES
}

fn default_true() -> bool {
    true
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_MAX_PASSES,
            default_recognizers: true,
            size_rules: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Load and validate a session file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, is not valid TOML for this
    /// schema, or fails [`validate`](Self::validate).
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid session file: {}", path.display()))?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).with_context(|| "Failed to parse TOML session definition")?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    fn resolve_paths(&mut self, dir: &Path) {
        if let Some(core) = &mut self.snapshot.core {
            if core.is_relative() {
                *core = dir.join(&*core);
            }
        }
        for segment in &mut self.snapshot.segments {
            if segment.file.is_relative() {
                segment.file = dir.join(&segment.file);
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        match (&self.snapshot.core, self.snapshot.segments.is_empty()) {
            (None, true) => {
                return Err("snapshot needs either `core` or at least one segment".to_string())
            }
            (Some(_), false) => {
                return Err("snapshot `core` and `segments` are mutually exclusive".to_string())
            }
            _ => {}
        }
        for segment in &self.snapshot.segments {
            if PermissionClass::from_mode(&segment.permissions).is_none() {
                return Err(format!(
                    "segment at {:#x}: invalid permissions {:?} (expected e.g. \"rw-\")",
                    segment.address, segment.permissions
                ));
            }
        }

        for heap in &self.heaps {
            check_range(&format!("heap {}", heap.name), heap.base, heap.limit)?;
        }
        for stack in &self.stacks {
            check_range(&format!("stack of thread {}", stack.thread), stack.base, stack.limit)?;
        }
        for module in &self.modules {
            check_range(&format!("module {}", module.name), module.base, module.limit)?;
        }
        for record in &self.records {
            if record.size == 0 {
                return Err(format!("record at {:#x} has size 0", record.address));
            }
        }

        let classification = &self.classification;
        if classification.max_passes == 0 {
            return Err("classification.max_passes must be >= 1, got 0".to_string());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        if classification.default_recognizers {
            seen.extend(STANDARD_TAGS);
        }
        for rule in &classification.size_rules {
            if rule.tag.is_empty() || rule.tag == TagHolder::UNTAGGED_NAME {
                return Err(format!("size rule tag {:?} is reserved", rule.tag));
            }
            if !seen.insert(rule.tag.as_str()) {
                return Err(format!("size rule tag {:?} is defined twice", rule.tag));
            }
        }
        if seen.len() > MAX_TAGS {
            return Err(format!(
                "{} tags configured, at most {} are supported",
                seen.len(),
                MAX_TAGS
            ));
        }
        Ok(())
    }

    /// Open the configured snapshot
    pub fn open_snapshot(&self) -> Result<Box<dyn Snapshot>> {
        if let Some(core) = &self.snapshot.core {
            let image = CoreFile::open(core)
                .with_context(|| format!("Failed to open core file: {}", core.display()))?;
            return Ok(Box::new(image));
        }
        let segments: Vec<RawSegment> = self
            .snapshot
            .segments
            .iter()
            .map(|s| RawSegment {
                address: s.address,
                file: s.file.clone(),
                permissions: PermissionClass::from_mode(&s.permissions)
                    .unwrap_or(PermissionClass::Inaccessible),
            })
            .collect();
        let image = RawDumpImage::open(&segments).with_context(|| "Failed to open segment dumps")?;
        Ok(Box::new(image))
    }
}

fn check_range(what: &str, base: u64, limit: u64) -> Result<(), String> {
    if base >= limit {
        return Err(format!(
            "{}: empty or inverted range [{:#x}, {:#x})",
            what, base, limit
        ));
    }
    Ok(())
}

impl RootProvider for SessionConfig {
    fn modules(&self) -> Vec<ModuleRange> {
        self.modules.clone()
    }

    fn thread_stacks(&self) -> Vec<ThreadStack> {
        self.stacks.clone()
    }

    fn registers(&self) -> Vec<RegisterValue> {
        self.registers.clone()
    }
}
