//! Static analysis over the bounded changed-file set of a pull request.
//!
//! Analyzers are pluggable: each implements [`Analyzer`] and turns bounded
//! file contents into a flat issue list. They never see the network — the
//! server crate fetches and bounds the diff first. An analyzer that errors
//! degrades to an empty result for that analyzer; it never aborts the run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod container;
pub mod hygiene;
pub mod lint;
pub mod secrets;
pub mod workflow;

/// A changed file after diff bounding: the patch text plus the lines that
/// were added, pre-split for analyzers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedFile {
    pub path: String,
    /// Unified-diff patch for this file, possibly truncated.
    pub patch: String,
    /// Total changed lines (additions + deletions) before truncation.
    pub changed_lines: usize,
    /// True if the patch was cut at the per-file line cap.
    pub truncated: bool,
}

impl BoundedFile {
    /// Build from a raw patch, truncating at `max_lines` patch lines.
    pub fn bound(path: String, patch: &str, changed_lines: usize, max_lines: usize) -> Self {
        let line_count = patch.lines().count();
        if line_count <= max_lines {
            return Self {
                path,
                patch: patch.to_string(),
                changed_lines,
                truncated: false,
            };
        }
        let truncated_patch: String = patch
            .lines()
            .take(max_lines)
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            path,
            patch: truncated_patch,
            changed_lines,
            truncated: true,
        }
    }

    /// Lines added by this patch, without the leading `+`.
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.patch
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .map(|l| &l[1..])
    }

    /// The added content joined back into a text blob. For a newly added
    /// file this is the whole file; for an edit it is the added hunks only.
    pub fn added_content(&self) -> String {
        self.added_lines().collect::<Vec<_>>().join("\n")
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.rsplit_once('.').map(|(_, ext)| ext)
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Pull-request metadata as gathered from the source host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrMetadata {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub author_login: String,
    pub author_id: u64,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
    pub commit_count: u64,
    pub commit_messages: Vec<String>,
    pub head_sha: String,
}

/// CI outcome for the PR head commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Success,
    Failure,
    Cancelled,
    /// A run exists but its conclusion is unrecognized or still pending.
    Unknown,
    /// No workflows configured for the repository.
    NoWorkflows,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiReport {
    pub status: CiStatus,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub duration_secs: u64,
}

impl CiReport {
    pub fn no_workflows() -> Self {
        Self {
            status: CiStatus::NoWorkflows,
            tests_passed: 0,
            tests_failed: 0,
            duration_secs: 0,
        }
    }

    /// Fraction of tests that failed, 0.0 when no tests ran.
    pub fn test_failure_rate(&self) -> f64 {
        let total = self.tests_passed + self.tests_failed;
        if total == 0 {
            0.0
        } else {
            f64::from(self.tests_failed) / f64::from(total)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Lint,
    Container,
    Workflow,
    Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub file: String,
    pub line: Option<usize>,
    pub message: String,
}

/// Git-hygiene and size metrics, computed once per PR rather than per file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrMetrics {
    pub changed_lines: u64,
    pub changed_files: u64,
    pub commit_count: u64,
    /// Commit messages under the minimum-length heuristic.
    pub short_commit_messages: u64,
    pub description_length: usize,
    pub test_files_changed: u64,
    pub doc_files_changed: u64,
    /// Deterministic 0–10 git-hygiene score.
    pub git_score: f64,
}

impl PrMetrics {
    pub fn oversized(&self) -> bool {
        self.changed_lines > OVERSIZED_PR_LINES
    }
}

/// Changed-line count above which a PR is considered oversized.
pub const OVERSIZED_PR_LINES: u64 = 1000;

/// Aggregated output of all analyzers for one review run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticReport {
    pub issues: Vec<Issue>,
    pub metrics: PrMetrics,
    /// Names of analyzers that errored and were degraded to empty output.
    pub failed_analyzers: Vec<String>,
}

impl StaticReport {
    fn count(&self, kind: IssueKind, severity: Severity) -> u32 {
        self.issues
            .iter()
            .filter(|i| i.kind == kind && i.severity == severity)
            .count() as u32
    }

    pub fn lint_errors(&self) -> u32 {
        self.count(IssueKind::Lint, Severity::Error)
    }

    pub fn lint_warnings(&self) -> u32 {
        self.count(IssueKind::Lint, Severity::Warning)
    }

    pub fn secret_hits(&self) -> u32 {
        self.issues
            .iter()
            .filter(|i| i.kind == IssueKind::Secret)
            .count() as u32
    }

    /// Error-severity container findings (root user, inline secrets).
    pub fn container_unsafe(&self) -> u32 {
        self.count(IssueKind::Container, Severity::Error)
    }

    pub fn container_issues(&self) -> u32 {
        self.issues
            .iter()
            .filter(|i| i.kind == IssueKind::Container)
            .count() as u32
    }

    pub fn workflow_errors(&self) -> u32 {
        self.count(IssueKind::Workflow, Severity::Error)
    }
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer {0} failed: {1}")]
    Failed(&'static str, String),
}

/// A static pass over the bounded file set.
///
/// Implementations must be pure with respect to their inputs so that a
/// re-delivered job produces the same report.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn analyze(&self, files: &[BoundedFile]) -> Result<Vec<Issue>, AnalyzerError>;
}

fn default_analyzers() -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(lint::LintAnalyzer),
        Box::new(container::ContainerAnalyzer),
        Box::new(workflow::WorkflowAnalyzer),
        Box::new(secrets::SecretAnalyzer),
    ]
}

/// Run every registered analyzer plus the hygiene metrics pass.
///
/// An analyzer error is recorded in `failed_analyzers` and contributes
/// nothing to the issue list; the run itself never fails.
pub fn run_analyzers(files: &[BoundedFile], meta: &PrMetadata) -> StaticReport {
    let mut report = StaticReport {
        metrics: hygiene::compute_metrics(files, meta),
        ..StaticReport::default()
    };

    for analyzer in default_analyzers() {
        match analyzer.analyze(files) {
            Ok(mut issues) => report.issues.append(&mut issues),
            Err(_) => report.failed_analyzers.push(analyzer.name().to_string()),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_of(lines: &[&str]) -> String {
        lines.join("\n")
    }

    #[test]
    fn bound_keeps_short_patches_intact() {
        let patch = patch_of(&["@@ -1,2 +1,2 @@", "+let x = 1;", "-let x = 2;"]);
        let file = BoundedFile::bound("src/a.rs".into(), &patch, 2, 400);
        assert!(!file.truncated);
        assert_eq!(file.patch, patch);
    }

    #[test]
    fn bound_truncates_at_line_cap() {
        let lines: Vec<String> = (0..500).map(|i| format!("+line {}", i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let patch = patch_of(&refs);
        let file = BoundedFile::bound("src/a.rs".into(), &patch, 500, 400);
        assert!(file.truncated);
        assert_eq!(file.patch.lines().count(), 400);
        assert_eq!(file.changed_lines, 500);
    }

    #[test]
    fn added_lines_strips_markers_and_headers() {
        let patch = patch_of(&["+++ b/src/a.rs", "@@ -0,0 +1,2 @@", "+first", "+second", "-gone"]);
        let file = BoundedFile::bound("src/a.rs".into(), &patch, 3, 400);
        let added: Vec<&str> = file.added_lines().collect();
        assert_eq!(added, vec!["first", "second"]);
    }

    #[test]
    fn report_counts_by_kind_and_severity() {
        let report = StaticReport {
            issues: vec![
                Issue {
                    kind: IssueKind::Lint,
                    severity: Severity::Error,
                    file: "a.js".into(),
                    line: Some(1),
                    message: "x".into(),
                },
                Issue {
                    kind: IssueKind::Lint,
                    severity: Severity::Warning,
                    file: "a.js".into(),
                    line: Some(2),
                    message: "y".into(),
                },
                Issue {
                    kind: IssueKind::Secret,
                    severity: Severity::Error,
                    file: "b.env".into(),
                    line: Some(3),
                    message: "z".into(),
                },
            ],
            ..StaticReport::default()
        };
        assert_eq!(report.lint_errors(), 1);
        assert_eq!(report.lint_warnings(), 1);
        assert_eq!(report.secret_hits(), 1);
        assert_eq!(report.container_issues(), 0);
    }

    #[test]
    fn ci_failure_rate_handles_zero_tests() {
        let report = CiReport::no_workflows();
        assert_eq!(report.test_failure_rate(), 0.0);

        let report = CiReport {
            status: CiStatus::Failure,
            tests_passed: 6,
            tests_failed: 2,
            duration_secs: 90,
        };
        assert!((report.test_failure_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn run_analyzers_populates_metrics() {
        let meta = PrMetadata {
            number: 1,
            commit_count: 2,
            commit_messages: vec!["add feature".into(), "fix tests".into()],
            additions: 10,
            deletions: 2,
            changed_files: 1,
            ..PrMetadata::default()
        };
        let files = vec![BoundedFile::bound(
            "src/main.js".into(),
            "@@ -0,0 +1,1 @@\n+const x = 1;",
            1,
            400,
        )];
        let report = run_analyzers(&files, &meta);
        assert_eq!(report.metrics.changed_lines, 12);
        assert!(report.failed_analyzers.is_empty());
    }
}
