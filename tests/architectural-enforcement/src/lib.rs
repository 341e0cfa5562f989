//! Architectural Enforcement Integration Tests
//!
//! Scans the switchboard core sources for patterns that break the dispatcher's
//! runtime guarantees:
//! - No blocking `std::thread::sleep` in production code (async code sleeps
//!   through tokio)
//! - No `std::sync` locks (poisoning; `parking_lot` and `dashmap` are used)
//! - No `unwrap()` / `expect()` in production code
//! - No `println!` in the library (logging goes through `tracing`)
//!
//! Test modules (everything from the first `#[cfg(test)]` line) and comment
//! lines are ignored.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A forbidden pattern found in production code
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Source file
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// Root of the core library sources
#[must_use]
pub fn core_src_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("switchboard")
        .join("core")
        .join("src")
}

/// Production lines of a source file: `(line number, line)`
///
/// Stops at the first `#[cfg(test)]` and skips comment lines.
#[must_use]
pub fn production_lines(source: &str) -> Vec<(usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
        .collect()
}

/// Find lines containing any of `patterns` in the `.rs` files under `root`
///
/// Files named in `exempt` (file names, not paths) are skipped.
#[must_use]
pub fn scan(root: &Path, patterns: &[&str], exempt: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let name = entry.file_name().to_string_lossy();
        if exempt.iter().any(|ex| *ex == name) {
            continue;
        }
        let Ok(source) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (line, text) in production_lines(&source) {
            if patterns.iter().any(|p| text.contains(p)) {
                violations.push(Violation {
                    path: entry.path().to_path_buf(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_clean(patterns: &[&str], exempt: &[&str], rule: &str) {
        let root = core_src_dir();
        assert!(root.is_dir(), "core sources not found at {}", root.display());
        let violations = scan(&root, patterns, exempt);
        let report: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert!(
            violations.is_empty(),
            "{rule}:\n{}",
            report.join("\n")
        );
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n// std::thread::sleep\n#[cfg(test)]\nmod tests { std::thread::sleep }\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }

    #[test]
    fn test_no_blocking_sleep() {
        assert_clean(
            &["std::thread::sleep", "thread::sleep("],
            &[],
            "blocking sleep in async code; use tokio::time::sleep",
        );
    }

    #[test]
    fn test_no_std_sync_locks() {
        assert_clean(
            &["std::sync::Mutex", "std::sync::RwLock", "sync::{Mutex", "sync::{RwLock"],
            &[],
            "std::sync locks in core; use parking_lot or dashmap",
        );
    }

    #[test]
    fn test_no_unwrap_in_production() {
        assert_clean(
            &[".unwrap()", ".expect("],
            &[],
            "unwrap/expect in production code; propagate the error",
        );
    }

    #[test]
    fn test_no_println_in_library() {
        assert_clean(
            &["println!", "eprintln!"],
            &[],
            "printing from the library; use tracing",
        );
    }
}
