//! Text and JSON rendering of query results
//!
//! Every command produces one report. Text output is meant for people
//! reading a terminal; JSON output carries the same facts for scripts.

use crate::allocations::{ArenaStats, SourceReport};
use crate::cli::{Command, OutputFormat, RangeSelection, StackAction};
use crate::graph::{Explanation, Root, RootContents};
use crate::partition::{Tally, UsageSummary};
use crate::patterns::ClassificationReport;
use crate::query::{
    AddressDescription, AllocationSet, AllocationView, Grouping, ModuleReport, StackReport,
    SummaryRow,
};
use crate::session::Session;
use crate::snapshot::PermissionClass;
use anyhow::Result;
use serde::Serialize;
use std::ops::Range;

/// Bytes shown per hex dump line
const DUMP_WIDTH: usize = 16;

/// Run one command against a session and render its answer
pub fn render(session: &Session, command: &Command, format: OutputFormat) -> Result<String> {
    let report = match command {
        command if command.needs_allocations() && session.allocations_disabled() => {
            Report::Disabled {
                command: command.name(),
                sources: session.source_reports().to_vec(),
            }
        }
        Command::Count { set, filter } => {
            let filter = filter.to_filter()?;
            let tally = session.count_matching(session.select(*set, &filter));
            Report::Count {
                set: *set,
                count: tally.count,
                total_bytes: tally.total_bytes,
            }
        }
        Command::List { set, filter } => {
            let filter = filter.to_filter()?;
            let allocations = session.list_matching(session.select(*set, &filter));
            Report::List {
                set: *set,
                allocations,
            }
        }
        Command::Summarize { set, by, filter } => {
            let filter = filter.to_filter()?;
            let rows = session.summarize_by(*by, session.select(*set, &filter));
            Report::Summary {
                set: *set,
                by: *by,
                rows,
            }
        }
        Command::Explain { address } => explain(session, *address),
        Command::Show { address } => show(session, *address),
        Command::Ranges {
            which,
            class,
            summary,
        } => ranges(session, *which, *class, *summary),
        Command::Arenas => Report::Arenas {
            arenas: session.arenas().copied().collect(),
        },
        Command::Sources => Report::Sources {
            sources: session.source_reports().to_vec(),
            classification: session.classification_report(),
        },
        Command::Describe { address } => Report::Describe {
            address: *address,
            description: session.describe_address(*address),
        },
        Command::Stacks { action } => {
            let stacks = session.stacks();
            let tally = session.tally(stacks.iter().map(|s| s.start..s.end));
            Report::Stacks {
                action: *action,
                stacks,
                tally,
            }
        }
        Command::Modules => Report::Modules {
            modules: session.modules(),
        },
    };
    match format {
        OutputFormat::Text => Ok(report.format()),
        OutputFormat::Json => report.to_json(),
    }
}

fn explain(session: &Session, address: u64) -> Report<'_> {
    let Some((index, explanation)) = session.explain_address(address) else {
        return Report::NotAllocated { address };
    };
    let target = session.view(index);
    let path = match explanation {
        Explanation::Reachable(path) => Some(ExplainedPath {
            root: session.roots().get(path.root),
            steps: path
                .steps
                .iter()
                .map(|step| ExplainedStep {
                    via_offset: step.via_offset,
                    allocation: session.view(step.index),
                })
                .collect(),
        }),
        Explanation::Unreachable => None,
    };
    Report::Explain { target, path }
}

fn show(session: &Session, address: u64) -> Report<'_> {
    let Some(index) = session.lookup_containing(address) else {
        return Report::NotAllocated { address };
    };
    let allocation = session.view(index);
    let contents = session
        .snapshot()
        .read(allocation.record.address, allocation.record.size)
        .ok()
        .map(hex::encode);
    Report::Show {
        allocation,
        contents,
    }
}

fn ranges(
    session: &Session,
    which: RangeSelection,
    permissions: PermissionClass,
    summary: bool,
) -> Report<'_> {
    match which {
        RangeSelection::Claimed if summary => Report::ClaimSummary {
            permissions,
            usages: session.summarize_claims(permissions),
        },
        RangeSelection::Claimed => {
            let claimed: Vec<RangeRow> = session
                .claimed_ranges(permissions)
                .into_iter()
                .map(|claim| RangeRow {
                    start: claim.start,
                    end: claim.end,
                    usage: Some(claim.usage.to_string()),
                })
                .collect();
            let tally = session.tally(claimed.iter().map(RangeRow::range));
            Report::Ranges {
                which,
                permissions,
                ranges: claimed,
                tally,
            }
        }
        RangeSelection::Unclaimed => {
            let unclaimed = session.unclaimed(permissions);
            let tally = session.tally(unclaimed.iter().cloned());
            Report::Ranges {
                which,
                permissions,
                ranges: unclaimed
                    .into_iter()
                    .map(|r| RangeRow {
                        start: r.start,
                        end: r.end,
                        usage: None,
                    })
                    .collect(),
                tally,
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ExplainedStep<'a> {
    via_offset: u64,
    allocation: AllocationView<'a>,
}

#[derive(Debug, Serialize)]
struct ExplainedPath<'a> {
    root: &'a Root,
    steps: Vec<ExplainedStep<'a>>,
}

#[derive(Debug, Serialize)]
struct RangeRow {
    start: u64,
    end: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<String>,
}

impl RangeRow {
    fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// Rendered answer of one command
#[derive(Debug, Serialize)]
#[serde(tag = "report", rename_all = "snake_case")]
enum Report<'a> {
    Count {
        set: AllocationSet,
        count: usize,
        total_bytes: u64,
    },
    List {
        set: AllocationSet,
        allocations: Vec<AllocationView<'a>>,
    },
    Summary {
        set: AllocationSet,
        by: Grouping,
        rows: Vec<SummaryRow>,
    },
    Explain {
        target: AllocationView<'a>,
        /// `None` when no root reaches the target
        path: Option<ExplainedPath<'a>>,
    },
    Show {
        allocation: AllocationView<'a>,
        /// Hex of the allocation's bytes, if they were captured
        contents: Option<String>,
    },
    NotAllocated {
        address: u64,
    },
    Ranges {
        which: RangeSelection,
        permissions: PermissionClass,
        ranges: Vec<RangeRow>,
        tally: Tally,
    },
    ClaimSummary {
        permissions: PermissionClass,
        usages: Vec<UsageSummary>,
    },
    Arenas {
        arenas: Vec<ArenaStats>,
    },
    Sources {
        sources: Vec<SourceReport>,
        classification: ClassificationReport,
    },
    /// No allocator was recognized, so the command has nothing to answer
    Disabled {
        command: &'static str,
        sources: Vec<SourceReport>,
    },
    Describe {
        address: u64,
        description: AddressDescription<'a>,
    },
    Stacks {
        action: StackAction,
        stacks: Vec<StackReport>,
        tally: Tally,
    },
    Modules {
        modules: Vec<ModuleReport<'a>>,
    },
}

fn describe(view: &AllocationView<'_>) -> String {
    let state = if view.record.used { "used" } else { "free" };
    let mut text = format!(
        "{:#x} ({} allocation of size {:#x}, {}",
        view.record.address, state, view.record.size, view.tag_name
    );
    if view.internal {
        text.push_str(", internal");
    }
    if let Some(label) = view.label {
        text.push_str(&format!(", {}", label));
    }
    text.push(')');
    text
}

fn describe_address(address: u64, description: &AddressDescription<'_>) -> String {
    match description {
        AddressDescription::Allocation { allocation, offset } => format!(
            "Address {:#x} is at offset {:#x} of allocation {}\n",
            address,
            offset,
            describe(allocation)
        ),
        AddressDescription::Root { root, offset } => {
            let (start, end) = match root.contents {
                RootContents::Range { start, end } => (start, end),
                RootContents::Value(_) => (address, address),
            };
            format!(
                "Address {:#x} is at offset {:#x} of {} [{:#x}, {:#x})\n",
                address, offset, root, start, end
            )
        }
        AddressDescription::Claimed { claim } => format!(
            "Address {:#x} is in {} range [{:#x}, {:#x}) claimed by {}\n",
            address, claim.permissions, claim.start, claim.end, claim.usage
        ),
        AddressDescription::Unclaimed { range } => format!(
            "Address {:#x} is in unclaimed {} range [{:#x}, {:#x})\n",
            address, range.permissions, range.start, range.end
        ),
        AddressDescription::Unmapped => {
            format!("Address {:#x} is not mapped in the snapshot\n", address)
        }
    }
}

fn bytes(total: u64) -> String {
    format!("{:#x} ({}) bytes", total, total)
}

impl Report<'_> {
    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Format the report for display
    fn format(&self) -> String {
        let mut output = String::new();
        match self {
            Report::Count {
                set,
                count,
                total_bytes,
            } => {
                output.push_str(&format!(
                    "{} {} allocations use {}\n",
                    count,
                    set,
                    bytes(*total_bytes)
                ));
            }
            Report::List { set, allocations } => {
                let mut tally = Tally::default();
                for view in allocations {
                    output.push_str(&describe(view));
                    output.push('\n');
                    tally.add(view.record.size);
                }
                output.push_str(&format!(
                    "{} {} allocations use {}\n",
                    tally.count,
                    set,
                    bytes(tally.total_bytes)
                ));
            }
            Report::Summary { set, by, rows } => {
                let by = match by {
                    Grouping::Tag => "tag",
                    Grouping::Size => "size",
                    Grouping::Source => "source",
                };
                output.push_str(&format!("Summary of {} allocations by {}:\n", set, by));
                for row in rows {
                    output.push_str(&format!(
                        "  {}: {} allocations use {}\n",
                        row.key,
                        row.count,
                        bytes(row.bytes)
                    ));
                }
                if rows.is_empty() {
                    output.push_str("  (none)\n");
                }
            }
            Report::Explain { target, path } => match path {
                Some(path) => {
                    output.push_str(&format!("Allocation {} is anchored:\n", describe(target)));
                    let at = path
                        .root
                        .address()
                        .map(|a| format!(" at {:#x}", a))
                        .unwrap_or_default();
                    let mut offset = path.steps.first().map_or(0, |s| s.via_offset);
                    output.push_str(&format!("  {}{} +{:#x}\n", path.root, at, offset));
                    for (i, step) in path.steps.iter().enumerate() {
                        output.push_str(&format!("  -> {}", describe(&step.allocation)));
                        if let Some(next) = path.steps.get(i + 1) {
                            offset = next.via_offset;
                            output.push_str(&format!(" +{:#x}", offset));
                        }
                        output.push('\n');
                    }
                }
                None if target.record.used => {
                    output.push_str(&format!(
                        "Allocation {} is leaked: no root reaches it\n",
                        describe(target)
                    ));
                }
                None => {
                    output.push_str(&format!(
                        "Allocation {} is free, so nothing anchors it\n",
                        describe(target)
                    ));
                }
            },
            Report::Show {
                allocation,
                contents,
            } => {
                output.push_str(&format!("Allocation {}\n", describe(allocation)));
                match contents {
                    Some(hex) => {
                        // Two hex digits per byte
                        for (line, chunk) in hex.as_bytes().chunks(DUMP_WIDTH * 2).enumerate() {
                            let address = allocation.record.address + (line * DUMP_WIDTH) as u64;
                            let text = String::from_utf8_lossy(chunk);
                            output.push_str(&format!("  {:#014x}: {}\n", address, text));
                        }
                    }
                    None => output.push_str("  contents not captured\n"),
                }
            }
            Report::NotAllocated { address } => {
                output.push_str(&format!("Address {:#x} is not in any allocation\n", address));
            }
            Report::Ranges {
                which,
                permissions,
                ranges,
                tally,
            } => {
                let which = match which {
                    RangeSelection::Claimed => "claimed",
                    RangeSelection::Unclaimed => "unclaimed",
                };
                for row in ranges {
                    output.push_str(&format!(
                        "  [{:#x}, {:#x}) size {:#x}",
                        row.start,
                        row.end,
                        row.end - row.start
                    ));
                    if let Some(usage) = &row.usage {
                        output.push_str(&format!(" {}", usage));
                    }
                    output.push('\n');
                }
                output.push_str(&format!(
                    "{} {} {} ranges use {}\n",
                    tally.count,
                    which,
                    permissions,
                    bytes(tally.total_bytes)
                ));
            }
            Report::ClaimSummary {
                permissions,
                usages,
            } => {
                output.push_str(&format!("Claimed {} ranges by usage:\n", permissions));
                for usage in usages {
                    output.push_str(&format!(
                        "  {}: {} ranges use {}\n",
                        usage.usage,
                        usage.tally.count,
                        bytes(usage.tally.total_bytes)
                    ));
                }
            }
            Report::Arenas { arenas } => {
                if arenas.is_empty() {
                    output.push_str("No arenas\n");
                }
                for arena in arenas {
                    output.push_str(&format!(
                        "Arena [{:#x}, {:#x}) size {:#x} max size {:#x}\n",
                        arena.address, arena.limit, arena.size, arena.max_size
                    ));
                    output.push_str(&format!(
                        "  {} used allocations use {}\n",
                        arena.used_count,
                        bytes(arena.used_bytes)
                    ));
                    output.push_str(&format!(
                        "  {} free allocations, {} free\n",
                        arena.free_count,
                        bytes(arena.free_bytes)
                    ));
                }
            }
            Report::Sources {
                sources,
                classification,
            } => {
                for source in sources {
                    output.push_str(&format!("{}\n", source));
                }
                if sources.is_empty() {
                    output.push_str("No allocation sources configured\n");
                }
                output.push_str(&format!(
                    "Classification tagged {} allocations in {} passes",
                    classification.assigned, classification.passes
                ));
                if !classification.converged {
                    output.push_str(" (pass limit reached)");
                }
                output.push('\n');
                if classification.unreadable > 0 {
                    output.push_str(&format!(
                        "{} allocations could not be read\n",
                        classification.unreadable
                    ));
                }
            }
            Report::Disabled { command, sources } => {
                output.push_str(&format!(
                    "The {} command is currently disabled: no allocator was recognized in the snapshot\n",
                    command
                ));
                for source in sources {
                    output.push_str(&format!("  {}\n", source));
                }
                if sources.is_empty() {
                    output.push_str("  no allocation sources configured\n");
                }
            }
            Report::Describe {
                address,
                description,
            } => output.push_str(&describe_address(*address, description)),
            Report::Stacks {
                action,
                stacks,
                tally,
            } => {
                if *action != StackAction::Count {
                    for stack in stacks {
                        output.push_str(&format!(
                            "Thread {} stack [{:#x}, {:#x}) size {:#x}\n",
                            stack.thread,
                            stack.start,
                            stack.end,
                            stack.end - stack.start
                        ));
                        if *action == StackAction::Describe {
                            output.push_str(&format!(
                                "  {} references into {} used allocations\n",
                                stack.references, stack.allocations
                            ));
                        }
                    }
                }
                output.push_str(&format!(
                    "{} stacks use {}\n",
                    tally.count,
                    bytes(tally.total_bytes)
                ));
            }
            Report::Modules { modules } => {
                if modules.is_empty() {
                    output.push_str("No modules\n");
                }
                for module in modules {
                    output.push_str(&format!(
                        "Module {} [{:#x}, {:#x}) size {:#x}\n",
                        module.name,
                        module.start,
                        module.end,
                        module.end - module.start
                    ));
                    for claim in &module.mappings {
                        output.push_str(&format!(
                            "  [{:#x}, {:#x}) {}\n",
                            claim.start, claim.end, claim.permissions
                        ));
                    }
                }
            }
        }
        output
    }
}
