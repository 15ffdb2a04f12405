//! Meta-tests that verify build and test suite integrity
//!
//! These tests ensure that:
//! - The default build can capture from an input device
//! - E2E test files exist

use std::path::Path;

fn manifest(relative: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(relative);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e))
}

/// Value of `default = [...]` in a manifest's `[features]` table
fn default_features(contents: &str) -> Option<String> {
    let features = contents.split("[features]").nth(1)?;
    features
        .lines()
        .take_while(|l| !l.trim_start().starts_with('['))
        .find(|l| l.trim_start().starts_with("default"))
        .map(|l| l.to_string())
}

/// Verify live capture is part of the default build of both packages
#[test]
fn capture_is_default_feature() {
    for file in ["Cargo.toml", "crates/audiotrigger-core/Cargo.toml"] {
        let line = default_features(&manifest(file))
            .unwrap_or_else(|| panic!("{} has no default features", file));
        assert!(
            line.contains("\"capture\""),
            "{}: live capture must be enabled by default, found `{}`",
            file,
            line
        );
    }
}

/// Verify E2E test files exist and are not empty
#[test]
fn e2e_tests_exist() {
    let test_files = [
        "e2e_trigger_scenario.rs",
        "e2e_capture_files.rs",
        "e2e_config.rs",
        "e2e_replay.rs",
    ];

    for file in test_files {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join(file);
        let metadata = std::fs::metadata(&path)
            .unwrap_or_else(|_| panic!("Missing E2E test file: {}", file));
        assert!(
            metadata.len() > 100,
            "E2E test file {} appears to be empty or too small ({} bytes)",
            file,
            metadata.len()
        );
    }
}
