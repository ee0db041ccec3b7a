//! Integration Test: Blocking Call Prohibition
//!
//! The conductor serves every request from tokio tasks. A blocking call in
//! production code stalls a worker thread and, with it, every stream that
//! worker is driving.

use architectural_enforcement::{scan_directory, workspace_root, RULES};

#[test]
fn test_no_blocking_calls_in_production_code() {
    let root = workspace_root();
    let mut violations = Vec::new();
    for dir in ["conductor/core/src", "conductor/daemon/src"] {
        violations.extend(scan_directory(&root.join(dir), RULES));
    }

    if !violations.is_empty() {
        eprintln!("\nBlocking calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!(
            "\nFound {} blocking call(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_production_sources_are_present() {
    let root = workspace_root();
    assert!(root.join("conductor/core/src/lib.rs").exists());
    assert!(root.join("conductor/daemon/src/main.rs").exists());
}
