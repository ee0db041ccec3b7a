//! Architectural Enforcement
//!
//! Source scanner used by the integration tests in `tests/`. It walks the
//! production sources of the workspace and reports lines that use blocking
//! calls inside the async service:
//! - `std::thread::sleep` (use `tokio::time::sleep`)
//! - `reqwest::blocking` (use the async client)
//! - `block_on` / `blocking_lock` (deadlock the runtime when called from a task)
//! - `std::fs` outside configuration loading (runs before the runtime serves)
//!
//! Test modules are skipped: scanning stops at the first `#[cfg(test)]` line
//! of each file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A forbidden pattern
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Substring that triggers the rule
    pub pattern: &'static str,
    /// What to use instead
    pub advice: &'static str,
    /// Path fragments where the pattern is allowed
    pub allowed_in: &'static [&'static str],
}

/// Rules enforced on production sources
pub const RULES: &[Rule] = &[
    Rule {
        pattern: "std::thread::sleep",
        advice: "use tokio::time::sleep",
        allowed_in: &[],
    },
    Rule {
        pattern: "reqwest::blocking",
        advice: "use the async reqwest client",
        allowed_in: &[],
    },
    Rule {
        pattern: "block_on(",
        advice: "await the future instead",
        allowed_in: &[],
    },
    Rule {
        pattern: ".blocking_lock()",
        advice: "use .lock().await",
        allowed_in: &[],
    },
    Rule {
        pattern: "std::fs::",
        advice: "use tokio::fs in async code",
        allowed_in: &["config"],
    },
];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending pattern
    pub pattern: &'static str,
    /// What to use instead
    pub advice: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {} ({})",
            self.path.display(),
            self.line,
            self.pattern,
            self.advice
        )
    }
}

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Check one file's content against `rules`
#[must_use]
pub fn check_source(path: &Path, content: &str, rules: &[Rule]) -> Vec<Violation> {
    let path_text = path.to_string_lossy();
    let mut violations = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = line.split("//").next().unwrap_or(line);

        for rule in rules {
            if !code.contains(rule.pattern) {
                continue;
            }
            if rule.allowed_in.iter().any(|allowed| path_text.contains(allowed)) {
                continue;
            }
            violations.push(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                pattern: rule.pattern,
                advice: rule.advice,
            });
        }
    }
    violations
}

/// Scan every `.rs` file under `dir`
#[must_use]
pub fn scan_directory(dir: &Path, rules: &[Rule]) -> Vec<Violation> {
    let mut violations = Vec::new();
    if !dir.exists() {
        return violations;
    }

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        // test_utils is compiled only under cfg(test)
        if path.file_name().and_then(|s| s.to_str()) == Some("test_utils.rs") {
            continue;
        }
        if let Ok(content) = fs::read_to_string(path) {
            violations.extend(check_source(path, &content, rules));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_thread_sleep() {
        let src = "async fn f() {\n    std::thread::sleep(d);\n}\n";
        let found = check_source(Path::new("core/src/routing/router.rs"), src, RULES);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 2);
        assert_eq!(found[0].pattern, "std::thread::sleep");
    }

    #[test]
    fn test_skips_comments_and_test_modules() {
        let src = "// std::thread::sleep is forbidden\nfn f() {}\n#[cfg(test)]\nmod tests {\n    fn g() { std::thread::sleep(d); }\n}\n";
        assert!(check_source(Path::new("core/src/lib.rs"), src, RULES).is_empty());
    }

    #[test]
    fn test_allows_fs_in_config() {
        let src = "let s = std::fs::read_to_string(p);\n";
        assert!(check_source(Path::new("core/src/config/mod.rs"), src, RULES).is_empty());
        assert_eq!(
            check_source(Path::new("core/src/transport/http.rs"), src, RULES).len(),
            1
        );
    }
}
