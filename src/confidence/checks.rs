//! Automated checks feeding the confidence score.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Outcome of one automated check. A failed hard check fails the phase
/// regardless of score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub hard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            hard: false,
            detail: None,
        }
    }

    pub fn soft_fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            hard: false,
            detail: Some(detail.into()),
        }
    }

    pub fn hard_fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            hard: true,
            detail: Some(detail.into()),
        }
    }

    fn hard(mut self) -> Self {
        self.hard = true;
        self
    }
}

/// Did the phase touch every file it was asked to (or claimed to)?
///
/// `None` when nothing was planned, so the check does not dilute the score.
pub fn planned_files_touched(planned: &[String], touched: &[String]) -> Option<CheckResult> {
    if planned.is_empty() {
        return None;
    }
    let missing: Vec<&str> = planned
        .iter()
        .filter(|p| {
            let p = normalize(p);
            !touched.iter().any(|t| normalize(t) == p)
        })
        .map(|p| p.as_str())
        .collect();
    Some(if missing.is_empty() {
        CheckResult::pass("planned_files_touched")
    } else {
        CheckResult::soft_fail(
            "planned_files_touched",
            format!("not touched: {}", missing.join(", ")),
        )
    })
}

/// Scan touched files for leftover debug markers. Unreadable files are skipped.
pub fn debug_markers_absent(
    root: &Path,
    touched: &[String],
    markers: &[String],
) -> Option<CheckResult> {
    if touched.is_empty() || markers.is_empty() {
        return None;
    }
    let mut hits = Vec::new();
    for path in touched {
        let Ok(content) = std::fs::read_to_string(root.join(path)) else {
            continue;
        };
        for marker in markers {
            if let Some(line) = content.lines().position(|l| l.contains(marker.as_str())) {
                hits.push(format!("{}:{} ({})", path, line + 1, marker));
            }
        }
    }
    Some(if hits.is_empty() {
        CheckResult::pass("debug_markers_absent")
    } else {
        CheckResult::soft_fail("debug_markers_absent", hits.join(", "))
    })
}

/// Result of the build command as a hard check.
pub fn build_passed(success: bool, detail: &str) -> CheckResult {
    if success {
        CheckResult::pass("build_passed").hard()
    } else {
        CheckResult::hard_fail("build_passed", detail)
    }
}

fn normalize(path: &str) -> &str {
    path.trim().trim_start_matches("./")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_planned_files() {
        assert!(planned_files_touched(&[], &strings(&["a.rs"])).is_none());

        let ok = planned_files_touched(&strings(&["./src/a.rs"]), &strings(&["src/a.rs", "b.rs"]))
            .unwrap();
        assert!(ok.passed);

        let missing = planned_files_touched(&strings(&["src/a.rs", "src/c.rs"]), &strings(&["src/a.rs"]))
            .unwrap();
        assert!(!missing.passed);
        assert!(!missing.hard);
        assert_eq!(missing.detail.as_deref(), Some("not touched: src/c.rs"));
    }

    #[test]
    fn test_debug_markers() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("clean.rs"), "fn main() {}\n").unwrap();
        std::fs::write(dir.path().join("dirty.js"), "let a = 1;\nconsole.log(a);\n").unwrap();
        let markers = strings(&["dbg!(", "console.log("]);

        let clean = debug_markers_absent(dir.path(), &strings(&["clean.rs"]), &markers).unwrap();
        assert!(clean.passed);

        let dirty = debug_markers_absent(
            dir.path(),
            &strings(&["clean.rs", "dirty.js", "deleted.rs"]),
            &markers,
        )
        .unwrap();
        assert!(!dirty.passed);
        assert_eq!(dirty.detail.as_deref(), Some("dirty.js:2 (console.log()"));

        assert!(debug_markers_absent(dir.path(), &[], &markers).is_none());
    }

    #[test]
    fn test_build_passed_is_hard() {
        assert!(build_passed(true, "").hard);
        let failed = build_passed(false, "exit code 101");
        assert!(failed.hard && !failed.passed);
    }
}
