//! Heuristic lint pass over added lines of recognized source files.
//!
//! This is not a real linter; it flags the handful of patterns that are
//! almost always wrong in submitted code (leftover debug output, `eval`,
//! `var` declarations) and the low-signal style issues (overlong lines,
//! trailing whitespace) that feed the deterministic code-quality score.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Analyzer, AnalyzerError, BoundedFile, Issue, IssueKind, Severity};

/// Extensions this pass understands. Anything else is skipped entirely.
const SOURCE_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "mjs", "cjs", "py", "rb", "go", "rs", "java", "kt", "cs", "php",
];

const MAX_LINE_LENGTH: usize = 120;

static DEBUG_OUTPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\W)(console\.(log|debug|trace)|print\(|println!\(.*dbg|dbg!\()").unwrap()
});

static EVAL_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\W)eval\s*\(").unwrap());

static VAR_DECL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)var\s+[A-Za-z_$]").unwrap());

static EMPTY_CATCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"catch\s*(\([^)]*\))?\s*\{\s*\}").unwrap());

pub struct LintAnalyzer;

impl Analyzer for LintAnalyzer {
    fn name(&self) -> &'static str {
        "lint"
    }

    fn analyze(&self, files: &[BoundedFile]) -> Result<Vec<Issue>, AnalyzerError> {
        let mut issues = Vec::new();

        for file in files {
            let Some(ext) = file.extension() else { continue };
            if !SOURCE_EXTENSIONS.contains(&ext) {
                continue;
            }
            let is_js = matches!(ext, "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs");

            for (idx, line) in file.added_lines().enumerate() {
                let push = |issues: &mut Vec<Issue>, severity, message: String| {
                    issues.push(Issue {
                        kind: IssueKind::Lint,
                        severity,
                        file: file.path.clone(),
                        line: Some(idx + 1),
                        message,
                    });
                };

                if DEBUG_OUTPUT.is_match(line) {
                    push(&mut issues, Severity::Error, "leftover debug output".into());
                }
                if EVAL_CALL.is_match(line) {
                    push(&mut issues, Severity::Error, "eval() on dynamic input".into());
                }
                if is_js && VAR_DECL.is_match(line) {
                    push(
                        &mut issues,
                        Severity::Error,
                        "var declaration; use let or const".into(),
                    );
                }
                if EMPTY_CATCH.is_match(line) {
                    push(&mut issues, Severity::Error, "empty catch block".into());
                }
                if line.len() > MAX_LINE_LENGTH {
                    push(
                        &mut issues,
                        Severity::Warning,
                        format!("line exceeds {} characters", MAX_LINE_LENGTH),
                    );
                }
                if line.ends_with(' ') || line.ends_with('\t') {
                    push(&mut issues, Severity::Warning, "trailing whitespace".into());
                }
            }
        }

        Ok(issues)
    }
}
