//! Prompt construction for the LLM review call.
//!
//! The prompt is bounded by construction: the diff has already been cut to
//! the top files by changed lines and per-file line caps before it gets
//! here, and the static/CI sections are fixed-size summaries.

use std::fmt::Write as _;

use crate::analysis::{BoundedFile, CiReport, CiStatus, PrMetadata, StaticReport};
use crate::score::evidence;

/// Maximum number of changed files embedded in the prompt, largest first.
pub const MAX_DIFF_FILES: usize = 20;

/// Maximum patch lines per file.
pub const MAX_LINES_PER_FILE: usize = 400;

/// System prompt for the review call.
pub fn get_system_prompt() -> String {
    include_str!("../prompt.txt").to_string()
}

/// Select the top-N files by changed lines and truncate each patch.
pub fn bound_files(mut files: Vec<(String, String, usize)>) -> Vec<BoundedFile> {
    files.sort_by(|a, b| b.2.cmp(&a.2));
    files
        .into_iter()
        .take(MAX_DIFF_FILES)
        .map(|(path, patch, changed)| {
            BoundedFile::bound(path, &patch, changed, MAX_LINES_PER_FILE)
        })
        .collect()
}

/// Build the user prompt from everything gathered for the review.
pub fn create_user_prompt(
    meta: &PrMetadata,
    files: &[BoundedFile],
    report: &StaticReport,
    ci: &CiReport,
) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "PULL REQUEST #{}: {}", meta.number, meta.title);
    let _ = writeln!(
        prompt,
        "Author: {} | {} commits | +{} -{} across {} files",
        meta.author_login, meta.commit_count, meta.additions, meta.deletions, meta.changed_files
    );
    if let Some(body) = meta.body.as_deref().filter(|b| !b.trim().is_empty()) {
        let _ = writeln!(prompt, "\nDESCRIPTION:\n{}", truncate(body, 2000));
    }

    let _ = writeln!(prompt, "\nSTATIC ANALYSIS:");
    for line in evidence(report, ci) {
        let _ = writeln!(prompt, "- {}", line);
    }
    for issue in report.issues.iter().take(30) {
        let _ = writeln!(
            prompt,
            "- [{:?}/{:?}] {}:{} {}",
            issue.kind,
            issue.severity,
            issue.file,
            issue.line.map_or_else(|| "-".to_string(), |l| l.to_string()),
            issue.message
        );
    }

    let _ = writeln!(prompt, "\nCI: {:?}", ci.status);
    if ci.status != CiStatus::NoWorkflows {
        let _ = writeln!(
            prompt,
            "Tests: {} passed, {} failed, {}s total",
            ci.tests_passed, ci.tests_failed, ci.duration_secs
        );
    }

    let _ = writeln!(prompt, "\nDIFF ({} files, largest first):", files.len());
    for file in files {
        let _ = writeln!(
            prompt,
            "\n=== {}{} ===\n{}",
            file.path,
            if file.truncated { " (truncated)" } else { "" },
            file.patch
        );
    }

    prompt
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PrMetrics;

    fn meta() -> PrMetadata {
        PrMetadata {
            number: 42,
            title: "Add checkout flow".into(),
            body: Some("Implements the cart checkout.".into()),
            author_login: "student".into(),
            author_id: 9,
            additions: 120,
            deletions: 30,
            changed_files: 3,
            commit_count: 4,
            commit_messages: vec![],
            head_sha: "abc123".into(),
        }
    }

    #[test]
    fn bound_files_keeps_largest_and_caps_count() {
        let files: Vec<(String, String, usize)> = (0..30)
            .map(|i| (format!("src/f{}.js", i), format!("+line{}\n", i), i))
            .collect();
        let bounded = bound_files(files);
        assert_eq!(bounded.len(), MAX_DIFF_FILES);
        // Largest first.
        assert_eq!(bounded[0].changed_lines, 29);
        assert!(bounded.iter().all(|f| f.changed_lines >= 10));
    }

    #[test]
    fn prompt_embeds_metadata_static_report_and_diff() {
        let files = vec![BoundedFile::bound(
            "src/cart.js".into(),
            "@@ -0,0 +1,1 @@\n+const cart = [];",
            1,
            MAX_LINES_PER_FILE,
        )];
        let report = StaticReport {
            metrics: PrMetrics {
                changed_lines: 150,
                changed_files: 3,
                ..PrMetrics::default()
            },
            ..StaticReport::default()
        };
        let ci = CiReport::no_workflows();
        let prompt = create_user_prompt(&meta(), &files, &report, &ci);

        assert!(prompt.contains("PULL REQUEST #42: Add checkout flow"));
        assert!(prompt.contains("STATIC ANALYSIS:"));
        assert!(prompt.contains("=== src/cart.js ==="));
        assert!(prompt.contains("const cart = []"));
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let mut m = meta();
        m.body = Some("x".repeat(5000));
        let prompt =
            create_user_prompt(&m, &[], &StaticReport::default(), &CiReport::no_workflows());
        assert!(prompt.len() < 4000);
    }

    #[test]
    fn system_prompt_names_all_ten_categories() {
        let system = get_system_prompt();
        for field in crate::llm::CATEGORY_FIELDS {
            assert!(system.contains(field), "missing {}", field);
        }
    }
}
