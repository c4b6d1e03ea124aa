//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code does its I/O through `tokio::fs`, `tokio::io`
//! and the async `reqwest` client.
//! **Exception**: configuration is read synchronously before the runtime
//! serves any request.

use architectural_enforcement::{in_file, report, scan, CodeLine};

/// Files allowed to use `std::fs`
const STARTUP_ONLY: &[&str] = &["engine/core/src/config/mod.rs"];

fn blocking_io_violation(line: &CodeLine) -> Option<String> {
    let code = &line.code;
    if (code.contains("std::fs::") || code.contains("use std::fs")) && !in_file(line, STARTUP_ONLY) {
        return Some(line.describe("Blocking file I/O"));
    }
    if code.contains("std::net::") || code.contains("use std::net") {
        return Some(line.describe("Blocking network I/O"));
    }
    if code.contains("reqwest::blocking") {
        return Some(line.describe("Blocking HTTP client"));
    }
    if code.contains("std::process::Command") {
        return Some(line.describe("Blocking process spawn"));
    }
    None
}

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = scan(blocking_io_violation);
    report(
        "Blocking I/O calls found in production code!",
        &violations,
        &[
            "REQUIRED: tokio::fs::read_to_string().await, tokio::fs::write().await",
            "REQUIRED: reqwest::Client with a timeout",
        ],
    );
}
