//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code waits on I/O, timers from `tokio::time::interval`,
//! or synchronization primitives. It never sleeps to pass time.
//! **Exception**: synthetic models sleep to simulate inference latency.

use architectural_enforcement::{in_file, report, scan, CodeLine};

/// Files allowed to call `tokio::time::sleep`
const SIMULATED_LATENCY: &[&str] = &["engine/core/src/model/synthetic.rs"];

fn sleep_violation(line: &CodeLine) -> Option<String> {
    let code = &line.code;
    if code.contains("std::thread::sleep") || code.contains("thread::sleep(") {
        return Some(line.describe("Blocking thread sleep"));
    }
    if (code.contains("::sleep(") || code.contains(".sleep(")) && !in_file(line, SIMULATED_LATENCY) {
        return Some(line.describe("Sleep in production code"));
    }
    None
}

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(sleep_violation);
    report(
        "Sleep calls found in production code!",
        &violations,
        &[
            "ACCEPTABLE: tokio::time::interval for periodic work",
            "ACCEPTABLE: timeout / timeout_at around I/O",
            "FORBIDDEN: sleep in polling loops or as synchronization",
        ],
    );
}
