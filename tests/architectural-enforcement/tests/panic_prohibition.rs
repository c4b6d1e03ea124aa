//! Integration Test: Panic and Global State Prohibition
//!
//! **Policy**: Production code reports failure through `Result`. Shared state
//! is owned by the engine and passed explicitly, never held in globals.

use architectural_enforcement::{report, scan, CodeLine};

const PANICKING: &[(&str, &str)] = &[
    (".unwrap()", "unwrap"),
    (".expect(", "expect"),
    ("panic!(", "panic!"),
    ("unreachable!(", "unreachable!"),
    ("todo!(", "todo!"),
    ("unimplemented!(", "unimplemented!"),
];

const GLOBALS: &[(&str, &str)] = &[
    ("static mut ", "mutable static"),
    ("lazy_static!", "lazy_static"),
    ("thread_local!", "thread-local state"),
];

fn panic_violation(line: &CodeLine) -> Option<String> {
    PANICKING
        .iter()
        .find(|(pattern, _)| line.code.contains(pattern))
        .map(|(_, name)| line.describe(&format!("Panicking call ({name})")))
}

fn global_violation(line: &CodeLine) -> Option<String> {
    GLOBALS
        .iter()
        .find(|(pattern, _)| line.code.contains(pattern))
        .map(|(_, name)| line.describe(&format!("Global state ({name})")))
}

#[test]
fn test_no_panicking_shortcuts_in_production_code() {
    let violations = scan(panic_violation);
    report(
        "Panicking calls found in production code!",
        &violations,
        &["REQUIRED: propagate with `?` and a typed error (thiserror) or anyhow context"],
    );
}

#[test]
fn test_no_global_mutable_state() {
    let violations = scan(global_violation);
    report(
        "Global state found in production code!",
        &violations,
        &["REQUIRED: keep state in the engine or its components and share it with Arc"],
    );
}
