//! CLI argument parsing for heapsift

use crate::query::{AllocationFilter, AllocationSet, Grouping};
use crate::snapshot::PermissionClass;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;

/// Output format for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "heapsift")]
#[command(version)]
#[command(about = "Postmortem heap analysis of captured process memory", long_about = None)]
pub struct Cli {
    /// Session file naming the snapshot, heaps and roots
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Count the allocations of a set and their total size
    Count {
        #[arg(value_enum)]
        set: AllocationSet,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// List the allocations of a set
    List {
        #[arg(value_enum)]
        set: AllocationSet,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Summarize the allocations of a set by tag, size or source
    Summarize {
        #[arg(value_enum)]
        set: AllocationSet,
        /// Grouping key
        #[arg(long, value_enum, default_value = "tag")]
        by: Grouping,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show a shortest reference path from a root to the allocation at ADDRESS
    Explain {
        #[arg(value_parser = parse_number)]
        address: u64,
    },
    /// Hex dump of the allocation holding ADDRESS
    Show {
        #[arg(value_parser = parse_number)]
        address: u64,
    },
    /// Claimed or unclaimed address ranges of one permission class
    Ranges {
        #[arg(value_enum)]
        which: RangeSelection,
        /// inaccessible, readonly, rxonly, writable (or an rwx triple)
        class: PermissionClass,
        /// Totals per usage instead of individual ranges (claimed only)
        #[arg(long)]
        summary: bool,
    },
    /// Per-arena accounting
    Arenas,
    /// Allocation sources and classification status
    Sources,
    /// What ADDRESS belongs to: an allocation, a stack, a module or a range
    Describe {
        #[arg(value_parser = parse_number)]
        address: u64,
    },
    /// Thread stacks and the references they hold
    Stacks {
        #[arg(value_enum, default_value = "list")]
        action: StackAction,
    },
    /// Loaded modules and the mappings their images occupy
    Modules,
}

impl Command {
    /// Subcommand name as typed on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Command::Count { .. } => "count",
            Command::List { .. } => "list",
            Command::Summarize { .. } => "summarize",
            Command::Explain { .. } => "explain",
            Command::Show { .. } => "show",
            Command::Ranges { .. } => "ranges",
            Command::Arenas => "arenas",
            Command::Sources => "sources",
            Command::Describe { .. } => "describe",
            Command::Stacks { .. } => "stacks",
            Command::Modules => "modules",
        }
    }

    /// Whether the command answers from allocations alone
    pub fn needs_allocations(&self) -> bool {
        matches!(
            self,
            Command::Count { .. }
                | Command::List { .. }
                | Command::Summarize { .. }
                | Command::Explain { .. }
                | Command::Show { .. }
                | Command::Arenas
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StackAction {
    /// Number of stacks and their total size
    Count,
    /// One line per stack
    List,
    /// Each stack with the references it holds into the heap
    Describe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeSelection {
    Claimed,
    Unclaimed,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only allocations of at least this many bytes
    #[arg(long, value_name = "BYTES", value_parser = parse_number)]
    pub min_size: Option<u64>,

    /// Only allocations of at most this many bytes
    #[arg(long, value_name = "BYTES", value_parser = parse_number)]
    pub max_size: Option<u64>,

    /// Only allocations whose tag name matches this regex
    #[arg(long, value_name = "REGEX")]
    pub tag: Option<String>,
}

impl FilterArgs {
    pub fn to_filter(&self) -> Result<AllocationFilter> {
        let tag = match &self.tag {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .with_context(|| format!("Invalid tag regex: {}", pattern))?,
            ),
            None => None,
        };
        Ok(AllocationFilter {
            min_size: self.min_size,
            max_size: self.max_size,
            tag,
        })
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
pub fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("Invalid number {:?}: {}", s, e))
}
