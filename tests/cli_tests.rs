// Command-line integration tests over raw dump snapshots
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const HEAP: u64 = 0x10000;
const STACK: u64 = 0x7000;

/// Chunk heap of 0x100 bytes: A -> B anchored from the stack, C leaked, D free
///
/// ```text
/// 0x00 A used | 0x20 B used | 0x40 C used | 0x60 D free | 0x80 top
/// ```
fn heap_bytes() -> Vec<u8> {
    let mut bytes = vec![0u8; 0x100];
    let mut put = |offset: usize, value: u64| {
        bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    };
    put(0x08, 0x21);
    put(0x28, 0x21);
    put(0x48, 0x21);
    put(0x68, 0x21);
    put(0x88, 0x80);
    put(0x10, HEAP + 0x30);
    bytes
}

fn stack_bytes() -> Vec<u8> {
    let mut bytes = vec![0u8; 0x20];
    bytes[..8].copy_from_slice(&(HEAP + 0x10).to_le_bytes());
    bytes
}

fn session_dir() -> TempDir {
    session_dir_with_heap(heap_bytes())
}

fn session_dir_with_heap(heap: Vec<u8>) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("heap.bin"), heap).unwrap();
    fs::write(dir.path().join("stack.bin"), stack_bytes()).unwrap();
    let config = format!(
        r#"
[[snapshot.segments]]
address = {heap:#x}
file = "heap.bin"

[[snapshot.segments]]
address = {stack:#x}
file = "stack.bin"

[[heaps]]
name = "main"
base = {heap:#x}
limit = {limit:#x}

[[stacks]]
thread = 1
base = {stack:#x}
limit = {stack_limit:#x}
"#,
        heap = HEAP,
        limit = HEAP + 0x100,
        stack = STACK,
        stack_limit = STACK + 0x20,
    );
    fs::write(dir.path().join("session.toml"), config).unwrap();
    dir
}

fn heapsift(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("heapsift").unwrap();
    cmd.arg("--config").arg(dir.path().join("session.toml"));
    cmd
}

#[test]
fn test_count_leaked() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("count")
        .arg("leaked")
        .assert()
        .success()
        .stdout("1 leaked allocations use 0x18 (24) bytes\n");
}

#[test]
fn test_count_used_json() {
    let dir = session_dir();
    let output = heapsift(&dir)
        .arg("--format")
        .arg("json")
        .arg("count")
        .arg("used")
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["count"], 3);
    assert_eq!(value["total_bytes"], 0x48);
}

#[test]
fn test_list_free() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("list")
        .arg("free")
        .assert()
        .success()
        .stdout(predicate::str::contains("0x10070 (free allocation of size 0x18"))
        .stdout(predicate::str::contains("1 free allocations use 0x18 (24) bytes"));
}

#[test]
fn test_explain_anchored_path() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("explain")
        .arg("0x10038")
        .assert()
        .success()
        .stdout(predicate::str::contains("Allocation 0x10030"))
        .stdout(predicate::str::contains("is anchored"))
        .stdout(predicate::str::contains("stack of thread 1 at 0x7000 +0x0"))
        .stdout(predicate::str::contains("-> 0x10010"));
}

#[test]
fn test_explain_leaked() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("explain")
        .arg(format!("{:#x}", HEAP + 0x50))
        .assert()
        .success()
        .stdout(predicate::str::contains("is leaked"));
}

#[test]
fn test_arenas_and_sources() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("arenas")
        .assert()
        .success()
        .stdout(predicate::str::contains("Arena [0x10000, 0x10100)"))
        .stdout(predicate::str::contains("3 used allocations use 0x48 (72) bytes"));
    heapsift(&dir)
        .arg("sources")
        .assert()
        .success()
        .stdout(predicate::str::contains("main: available (4 allocations)"));
}

#[test]
fn test_ranges_claimed_writable() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("ranges")
        .arg("claimed")
        .arg("writable")
        .assert()
        .success()
        .stdout(predicate::str::contains("stack of thread 1"))
        .stdout(predicate::str::contains("heap arena at 0x10000"))
        .stdout(predicate::str::contains("2 claimed writable ranges use 0x120 (288) bytes"));
}

#[test]
fn test_missing_session_file_fails() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("heapsift").unwrap();
    cmd.arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("arenas")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read session file"));
}

#[test]
fn test_invalid_tag_regex_fails() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("count")
        .arg("used")
        .arg("--tag")
        .arg("(")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid tag regex"));
}

#[test]
fn test_corrupt_heap_disables_allocation_commands() {
    let dir = session_dir_with_heap(vec![0u8; 0x100]);
    heapsift(&dir)
        .arg("count")
        .arg("leaked")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "The count command is currently disabled",
        ))
        .stdout(predicate::str::contains("main: unavailable"));
    let output = heapsift(&dir)
        .arg("--format")
        .arg("json")
        .arg("list")
        .arg("used")
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["report"], "disabled");
    assert_eq!(value["command"], "list");
    // Address space commands keep working without allocations
    heapsift(&dir)
        .arg("stacks")
        .arg("count")
        .assert()
        .success()
        .stdout("1 stacks use 0x20 (32) bytes\n");
}

#[test]
fn test_describe_addresses() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("describe")
        .arg("0x10038")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Address 0x10038 is at offset 0x8 of allocation 0x10030",
        ));
    heapsift(&dir)
        .arg("describe")
        .arg("0x10088")
        .assert()
        .success()
        .stdout(
            "Address 0x10088 is in writable range [0x10000, 0x10100) claimed by heap arena at 0x10000\n",
        );
    heapsift(&dir)
        .arg("describe")
        .arg("0x7008")
        .assert()
        .success()
        .stdout("Address 0x7008 is at offset 0x8 of stack of thread 1 [0x7000, 0x7020)\n");
}

#[test]
fn test_stacks_describe() {
    let dir = session_dir();
    heapsift(&dir)
        .arg("stacks")
        .arg("describe")
        .assert()
        .success()
        .stdout(predicate::str::contains("Thread 1 stack [0x7000, 0x7020) size 0x20"))
        .stdout(predicate::str::contains("1 references into 1 used allocations"));
    heapsift(&dir)
        .arg("modules")
        .assert()
        .success()
        .stdout("No modules\n");
}
