//! heapsift - postmortem heap analysis of captured process memory
//!
//! A session indexes every allocation a snapshot's allocators know about,
//! derives the reference graph between allocations and from roots, names
//! allocations by the container structures they belong to, and partitions
//! the address space by usage. All of it is read-only once built, so any
//! number of queries can run against one session.

pub mod allocations;
pub mod cli;
pub mod config;
pub mod graph;
pub mod partition;
pub mod patterns;
pub mod query;
pub mod report;
pub mod session;
pub mod snapshot;
