//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests in `tests/`. Each test walks the
//! production sources of the engine crates and fails with a list of
//! offending lines:
//! - No sleeping outside simulated model latency
//! - No blocking I/O once the runtime is up
//! - No panicking shortcuts or mutable globals in the serving path
//!
//! "Production" means everything in a file before its `#[cfg(test)]`
//! module. Test support (`test_utils.rs`) is not production code.

use std::fs;
use std::path::{Path, PathBuf};

/// Crate sources checked by every rule
pub const PRODUCTION_DIRS: &[&str] = &["engine/core/src", "engine/daemon/src"];

/// Files that only exist to support tests
const TEST_SUPPORT: &[&str] = &["test_utils.rs"];

/// Workspace root, resolved from this package's manifest
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// One line of production code with comments removed
#[derive(Debug, Clone)]
pub struct CodeLine {
    pub path: PathBuf,
    pub number: usize,
    pub code: String,
    pub raw: String,
}

impl CodeLine {
    /// Path relative to the workspace root, with `/` separators
    pub fn relative_path(&self) -> String {
        let root = workspace_root();
        self.path
            .strip_prefix(&root)
            .unwrap_or(&self.path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub fn describe(&self, rule: &str) -> String {
        format!("{}:{} - {rule}: {}", self.relative_path(), self.number, self.raw.trim())
    }
}

/// Code part of a line, without a trailing `//` comment
pub fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Production lines of one file
pub fn production_lines(path: &Path) -> Vec<CodeLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| CodeLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: strip_comment(line).to_string(),
            raw: line.to_string(),
        })
        .collect()
}

/// Every `.rs` production file under the checked directories
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        assert!(path.exists(), "expected source directory {} to exist", path.display());

        for entry in walkdir::WalkDir::new(&path).into_iter().filter_map(Result::ok) {
            let file = entry.path();
            let is_rust = file.extension().and_then(|s| s.to_str()) == Some("rs");
            let is_support = file
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| TEST_SUPPORT.contains(&n));
            if is_rust && !is_support {
                files.push(file.to_path_buf());
            }
        }
    }
    files.sort();
    files
}

/// Apply `check` to every production line, collecting violations
pub fn scan(check: impl Fn(&CodeLine) -> Option<String>) -> Vec<String> {
    production_files()
        .iter()
        .flat_map(|file| production_lines(file))
        .filter_map(|line| check(&line))
        .collect()
}

/// Whether `line` lives in one of the allowlisted files
pub fn in_file(line: &CodeLine, allowed: &[&str]) -> bool {
    let relative = line.relative_path();
    allowed.iter().any(|a| relative.ends_with(a))
}

/// Print violations and fail
pub fn report(title: &str, violations: &[String], guidance: &[&str]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n{title}\n");
    for violation in violations {
        eprintln!("  {violation}");
    }
    if !guidance.is_empty() {
        eprintln!();
        for line in guidance {
            eprintln!("  {line}");
        }
    }
    panic!("\nFound {} violation(s). Fix these before merging!", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("let x = 1; // note"), "let x = 1; ");
        assert_eq!(strip_comment("/// docs"), "");
    }

    #[test]
    fn test_finds_engine_sources() {
        let files = production_files();
        assert!(files.iter().any(|f| f.ends_with("engine/core/src/lib.rs")));
        assert!(!files.iter().any(|f| f.ends_with("test_utils.rs")));
    }
}
