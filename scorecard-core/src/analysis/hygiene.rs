//! PR-size and git-hygiene metrics.
//!
//! These are not issues: they feed the deterministic delivery-speed and
//! git-maturity scores and the oversized-PR override.

use super::{BoundedFile, PrMetadata, PrMetrics};

const SHORT_MESSAGE_CHARS: usize = 10;

/// Commit messages that carry no information regardless of length.
const NOISE_MESSAGES: &[&str] = &["wip", "fix", "fixes", "update", "updates", "asdf", "test", "tmp"];

fn is_test_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains("test")
        || lower.contains("spec.")
        || lower.contains("__tests__")
        || lower.starts_with("tests/")
}

fn is_doc_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".md") || lower.ends_with(".rst") || lower.contains("docs/")
}

pub fn compute_metrics(files: &[BoundedFile], meta: &PrMetadata) -> PrMetrics {
    let short_commit_messages = meta
        .commit_messages
        .iter()
        .filter(|m| {
            let t = m.trim();
            t.len() < SHORT_MESSAGE_CHARS || NOISE_MESSAGES.contains(&t.to_lowercase().as_str())
        })
        .count() as u64;

    let mut metrics = PrMetrics {
        changed_lines: meta.additions + meta.deletions,
        changed_files: meta.changed_files,
        commit_count: meta.commit_count,
        short_commit_messages,
        description_length: meta.body.as_deref().map_or(0, |b| b.trim().len()),
        test_files_changed: files.iter().filter(|f| is_test_file(&f.path)).count() as u64,
        doc_files_changed: files.iter().filter(|f| is_doc_file(&f.path)).count() as u64,
        git_score: 0.0,
    };
    metrics.git_score = git_score(&metrics);
    metrics
}

/// Deterministic 0–10 git-hygiene score.
///
/// Starts at 10 and penalizes uninformative commit messages, single-commit
/// dumps over large diffs, and missing PR descriptions.
fn git_score(metrics: &PrMetrics) -> f64 {
    let mut score = 10.0;

    if metrics.commit_count > 0 {
        let noise_ratio = metrics.short_commit_messages as f64 / metrics.commit_count as f64;
        score -= noise_ratio * 5.0;
    }

    if metrics.commit_count <= 1 && metrics.changed_lines > 500 {
        score -= 2.0;
    }

    if metrics.description_length == 0 {
        score -= 2.0;
    } else if metrics.description_length < 30 {
        score -= 1.0;
    }

    score.clamp(0.0, 10.0)
}
