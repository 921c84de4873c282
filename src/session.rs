//! One analysis session over one immutable snapshot
//!
//! Setup runs the phases strictly in order:
//!
//! ```text
//! sources ─► Finder ─► ReferenceGraph ─► classification ─► partition claims
//!                                            │
//!                             reachability (computed on first query)
//! ```
//!
//! Once [`SessionBuilder::build`] returns, every structure is read-only and
//! queries (see [`crate::query`]) never mutate classification state.

use crate::allocations::{AllocationSource, ChunkHeapSource, Finder, RecordListSource, TagHolder};
use crate::config::SessionConfig;
use crate::graph::{Reachability, ReferenceGraph, RootContents, RootKind, RootSet};
use crate::partition::{UsageKind, VirtualAddressPartition};
use crate::patterns::{
    register_standard_recognizers, ClassificationReport, Classifications,
    PatternRecognizerRegistry, Recognizer, SizeRule, SizeRuleRecognizer, DEFAULT_MAX_PASSES,
};
use crate::snapshot::Snapshot;
use anyhow::Result;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

type RecognizerFactory = Box<dyn FnOnce(&mut TagHolder) -> Box<dyn Recognizer>>;

/// Collects the inputs of a session before any phase runs
pub struct SessionBuilder {
    snapshot: Box<dyn Snapshot>,
    sources: Vec<Box<dyn AllocationSource>>,
    roots: RootSet,
    standard_recognizers: bool,
    recognizers: Vec<RecognizerFactory>,
    max_passes: usize,
}

impl SessionBuilder {
    pub fn new(snapshot: Box<dyn Snapshot>) -> Self {
        Self {
            snapshot,
            sources: Vec::new(),
            roots: RootSet::new(),
            standard_recognizers: true,
            recognizers: Vec::new(),
            max_passes: DEFAULT_MAX_PASSES,
        }
    }

    pub fn source(mut self, source: Box<dyn AllocationSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn roots(mut self, roots: RootSet) -> Self {
        self.roots = roots;
        self
    }

    /// Register the container recognizers ahead of any others (default on)
    pub fn standard_recognizers(mut self, enabled: bool) -> Self {
        self.standard_recognizers = enabled;
        self
    }

    /// Add a recognizer; `factory` registers its tags when the session builds
    pub fn recognizer<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&mut TagHolder) -> Box<dyn Recognizer> + 'static,
    {
        self.recognizers.push(Box::new(factory));
        self
    }

    pub fn size_rule(self, rule: SizeRule) -> Self {
        self.recognizer(move |tags| Box::new(SizeRuleRecognizer::new(tags, rule)))
    }

    /// # Panics
    /// `build` panics if `max_passes` is zero.
    pub fn max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    /// Run every setup phase
    pub fn build(self) -> Session {
        let snapshot = self.snapshot;
        let finder = Finder::build(snapshot.as_ref(), &self.sources);
        if finder.is_disabled() {
            warn!("no allocator recognized; allocation queries will see zero allocations");
        }
        let roots = self.roots;
        let graph = ReferenceGraph::build(snapshot.as_ref(), &finder, &roots);

        let mut tags = TagHolder::new(finder.count());
        let mut registry = PatternRecognizerRegistry::new(self.max_passes);
        if self.standard_recognizers {
            register_standard_recognizers(&mut registry, &mut tags);
        }
        for factory in self.recognizers {
            registry.register(factory(&mut tags));
        }
        let (classifications, report) =
            registry.classify(snapshot.as_ref(), &finder, &mut tags, &graph, &roots);

        let partition = claim_known_ranges(snapshot.as_ref(), &finder, &roots);

        info!(
            allocations = finder.count(),
            roots = roots.len(),
            edges = graph.edge_count(),
            tagged = report.assigned,
            passes = report.passes,
            "session ready"
        );
        Session {
            snapshot,
            finder,
            tags,
            classifications,
            report,
            roots,
            graph,
            reachability: OnceLock::new(),
            partition,
        }
    }
}

/// Claim module images, stacks and heap arenas; conflicts are logged
fn claim_known_ranges(
    snapshot: &dyn Snapshot,
    finder: &Finder,
    roots: &RootSet,
) -> VirtualAddressPartition {
    let mut partition = VirtualAddressPartition::new(snapshot.mapped_ranges());
    let mut requests = Vec::new();
    for root in roots.iter() {
        let RootContents::Range { start, end } = root.contents else {
            continue;
        };
        let usage = match &root.kind {
            RootKind::Module { name } => UsageKind::Module { name: name.clone() },
            RootKind::Stack { thread } => UsageKind::Stack { thread: *thread },
            RootKind::Register { .. } => continue,
        };
        requests.push((start..end, usage));
    }
    for arena in finder.arenas().values() {
        requests.push((
            arena.address..arena.limit,
            UsageKind::Heap {
                arena: arena.address,
            },
        ));
    }

    for (range, usage) in requests {
        for error in partition.claim_mapped(range, usage.clone()) {
            warn!(%usage, %error, "address range claim skipped");
        }
    }
    debug!(claims = partition.all_claims().count(), "address space partitioned");
    partition
}

/// Derived state of one snapshot, read-only after setup
///
/// A session is `Send + Sync`; several threads may query it at once.
pub struct Session {
    pub(crate) snapshot: Box<dyn Snapshot>,
    pub(crate) finder: Finder,
    pub(crate) tags: TagHolder,
    pub(crate) classifications: Classifications,
    pub(crate) report: ClassificationReport,
    pub(crate) roots: RootSet,
    pub(crate) graph: ReferenceGraph,
    pub(crate) reachability: OnceLock<Reachability>,
    pub(crate) partition: VirtualAddressPartition,
}

impl Session {
    pub fn builder(snapshot: Box<dyn Snapshot>) -> SessionBuilder {
        SessionBuilder::new(snapshot)
    }

    /// Open the configured snapshot and run setup
    ///
    /// Each `[[heaps]]` entry becomes its own chunk-walker source, so one
    /// corrupt heap only disables itself; `[[records]]` form one more source.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let snapshot = config.open_snapshot()?;
        let mut builder = SessionBuilder::new(snapshot)
            .roots(RootSet::from_provider(config))
            .standard_recognizers(config.classification.default_recognizers)
            .max_passes(config.classification.max_passes);
        for heap in &config.heaps {
            builder = builder.source(Box::new(ChunkHeapSource::new(
                heap.name.clone(),
                vec![heap.region()],
            )));
        }
        if !config.records.is_empty() {
            builder = builder.source(Box::new(RecordListSource::new(
                "records",
                config.records.clone(),
            )));
        }
        for rule in &config.classification.size_rules {
            builder = builder.size_rule(rule.clone());
        }
        Ok(builder.build())
    }

    pub fn snapshot(&self) -> &dyn Snapshot {
        self.snapshot.as_ref()
    }

    pub fn finder(&self) -> &Finder {
        &self.finder
    }

    pub fn tags(&self) -> &TagHolder {
        &self.tags
    }

    pub fn classifications(&self) -> &Classifications {
        &self.classifications
    }

    pub fn classification_report(&self) -> ClassificationReport {
        self.report
    }

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn graph(&self) -> &ReferenceGraph {
        &self.graph
    }

    pub fn partition(&self) -> &VirtualAddressPartition {
        &self.partition
    }

    /// Reachability from roots, computed once on first use
    pub fn reachability(&self) -> &Reachability {
        self.reachability
            .get_or_init(|| Reachability::compute(&self.graph, &self.roots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocations::{ArenaDescriptor, RawRecord};
    use crate::snapshot::{MemoryImage, PermissionClass};

    const HEAP: u64 = 0x10000;
    const STACK: u64 = 0x7000;

    fn image() -> MemoryImage {
        let mut image = MemoryImage::new();
        image
            .map(HEAP, vec![0; 0x1000], PermissionClass::Writable)
            .unwrap();
        image
            .map(STACK, vec![0; 0x1000], PermissionClass::Writable)
            .unwrap();
        image
    }

    fn stack_roots() -> RootSet {
        let mut roots = RootSet::new();
        roots.push(
            RootKind::Stack { thread: 1 },
            RootContents::Range {
                start: STACK,
                end: STACK + 0x1000,
            },
        );
        roots
    }

    fn records() -> Vec<RawRecord> {
        vec![RawRecord {
            address: HEAP + 0x10,
            size: 0x20,
            used: true,
            arena: Some(HEAP),
        }]
    }

    #[test]
    fn test_setup_claims_stacks_and_arenas() {
        let source = RecordListSource::new("list", records()).with_arena(ArenaDescriptor {
            address: HEAP,
            limit: HEAP + 0x1000,
            max_size: 0,
            unallocated_bytes: 0xfe0,
        });
        let session = Session::builder(Box::new(image()))
            .source(Box::new(source))
            .roots(stack_roots())
            .build();
        let claims = session.partition().claimed_ranges(PermissionClass::Writable);
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].usage, UsageKind::Stack { thread: 1 });
        assert_eq!(claims[1].usage, UsageKind::Heap { arena: HEAP });
    }

    #[test]
    fn test_conflicting_setup_claim_skipped() {
        // The module overlaps the stack; the module is claimed first.
        let mut roots = RootSet::new();
        roots.push(
            RootKind::Module {
                name: "app".to_string(),
            },
            RootContents::Range {
                start: STACK,
                end: STACK + 0x800,
            },
        );
        roots.push(
            RootKind::Stack { thread: 1 },
            RootContents::Range {
                start: STACK,
                end: STACK + 0x1000,
            },
        );
        let session = Session::builder(Box::new(image())).roots(roots).build();
        let claims = session.partition().claimed_ranges(PermissionClass::Writable);
        assert_eq!(claims.len(), 1);
        assert_eq!(
            claims[0].usage,
            UsageKind::Module {
                name: "app".to_string()
            }
        );
    }

    #[test]
    fn test_reachability_memoized() {
        let mut image = image();
        image.write_word(STACK, HEAP + 0x10);
        let session = Session::builder(Box::new(image))
            .source(Box::new(RecordListSource::new("list", records())))
            .roots(stack_roots())
            .build();
        let first: *const Reachability = session.reachability();
        let second: *const Reachability = session.reachability();
        assert_eq!(first, second);
        assert!(session.reachability().is_reachable(0));
    }

    #[test]
    fn test_custom_recognizers_follow_standard_ones() {
        let session = Session::builder(Box::new(image()))
            .source(Box::new(RecordListSource::new("list", records())))
            .size_rule(SizeRule {
                tag: "Widget".to_string(),
                size: 0x20,
                internal: false,
            })
            .build();
        let widget = session.tags().index_of("Widget").unwrap();
        assert_eq!(widget.get(), 8);
        assert_eq!(session.tags().tag_of(0), widget);
    }

    #[test]
    fn test_no_sources_is_disabled_not_error() {
        let session = Session::builder(Box::new(image())).build();
        assert!(session.finder().is_disabled());
        assert_eq!(session.finder().count(), 0);
        assert!(session.classification_report().converged);
    }

    #[test]
    fn test_session_queried_from_several_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Session>();

        let mut image = image();
        image.write_word(STACK, HEAP + 0x10);
        let session = Session::builder(Box::new(image))
            .source(Box::new(RecordListSource::new("list", records())))
            .roots(stack_roots())
            .build();
        let answers: Vec<bool> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| session.reachability().is_reachable(0)))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(answers, vec![true; 4]);
    }
}
