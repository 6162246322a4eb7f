//! Score-fusion engine.
//!
//! Each category gets a deterministic 0–10 sub-score computed from static
//! and CI signal alone, which is blended with the LLM's score for the same
//! category. Override rules then apply hard ceilings and floors that no
//! amount of model enthusiasm can argue past, every category is clamped to
//! [0,10], and the ten rounded categories sum to the 0–100 total behind the
//! badge.

use serde::{Deserialize, Serialize};

use crate::analysis::{CiReport, CiStatus, StaticReport};
use crate::llm::LlmReview;

/// Weight given to the LLM score in the blend; the remainder goes to the
/// deterministic score.
pub const FUSION_LLM_WEIGHT: f64 = 0.7;

/// Lint-error count above which fused code quality is capped at 4.
pub const LINT_ERROR_HARD_CAP_THRESHOLD: u32 = 50;

/// Lint-error count above which the legacy projection caps code quality at 5.
pub const LEGACY_LINT_ERROR_CAP_THRESHOLD: u32 = 20;

/// Lint-error count above which the deterministic code-quality score takes
/// an extra penalty and bug risk accumulates.
const LINT_ERROR_PENALTY_THRESHOLD: u32 = 20;

/// The ten category scores. Values are 0–10; stored as f64 while being
/// computed and rounded to whole numbers in the final breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScores {
    #[serde(rename = "codeQuality")]
    pub code_quality: f64,
    pub testing: f64,
    pub documentation: f64,
    pub security: f64,
    #[serde(rename = "devopsExecution")]
    pub devops: f64,
    #[serde(rename = "bugRisk")]
    pub bug_risk: f64,
    #[serde(rename = "deliverySpeed")]
    pub delivery_speed: f64,
    pub collaboration: f64,
    #[serde(rename = "gitMaturity")]
    pub git_maturity: f64,
    pub architecture: f64,
}

impl CategoryScores {
    pub fn uniform(value: f64) -> Self {
        Self {
            code_quality: value,
            testing: value,
            documentation: value,
            security: value,
            devops: value,
            bug_risk: value,
            delivery_speed: value,
            collaboration: value,
            git_maturity: value,
            architecture: value,
        }
    }

    pub fn as_array(&self) -> [f64; 10] {
        [
            self.code_quality,
            self.testing,
            self.documentation,
            self.security,
            self.devops,
            self.bug_risk,
            self.delivery_speed,
            self.collaboration,
            self.git_maturity,
            self.architecture,
        ]
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            code_quality: f(self.code_quality),
            testing: f(self.testing),
            documentation: f(self.documentation),
            security: f(self.security),
            devops: f(self.devops),
            bug_risk: f(self.bug_risk),
            delivery_speed: f(self.delivery_speed),
            collaboration: f(self.collaboration),
            git_maturity: f(self.git_maturity),
            architecture: f(self.architecture),
        }
    }

    pub fn clamped(&self) -> Self {
        self.map(|v| v.clamp(0.0, 10.0))
    }

    pub fn rounded(&self) -> Self {
        self.map(|v| v.clamp(0.0, 10.0).round())
    }

    /// Sum of the ten clamped, rounded categories: 0–100.
    pub fn total(&self) -> u8 {
        self.rounded().as_array().iter().sum::<f64>() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Badge {
    Green,
    Yellow,
    Red,
}

impl Badge {
    pub fn from_total(total: u8) -> Self {
        if total >= 75 {
            Badge::Green
        } else if total >= 50 {
            Badge::Yellow
        } else {
            Badge::Red
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::Green => "green",
            Badge::Yellow => "yellow",
            Badge::Red => "red",
        }
    }
}

/// The full scoring result for one review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Fused, overridden, clamped and rounded category scores.
    pub categories: CategoryScores,
    pub total: u8,
    pub badge: Badge,
    pub evidence: Vec<String>,
    pub summary: String,
    pub suggestions: Vec<String>,
    /// True when the LLM portion is the neutral fallback.
    pub fallback: bool,
}

/// Deterministic 0–10 sub-scores from static/CI signal alone.
pub fn deterministic_scores(report: &StaticReport, ci: &CiReport) -> CategoryScores {
    let m = &report.metrics;

    let mut code_quality =
        10.0 - f64::from(report.lint_errors()) * 0.5 - f64::from(report.lint_warnings()) * 0.2;
    if report.lint_errors() > LINT_ERROR_PENALTY_THRESHOLD {
        code_quality -= 2.0;
    }

    let security = if report.secret_hits() > 0 { 0.0 } else { 10.0 };

    // Risk accumulates, then inverts into a 0–10 "safety" score.
    let mut risk = 0.0;
    match ci.status {
        CiStatus::Failure => risk += 4.0,
        CiStatus::Cancelled => risk += 2.0,
        _ => {}
    }
    risk += ci.test_failure_rate() * 4.0;
    if report.lint_errors() > LINT_ERROR_PENALTY_THRESHOLD {
        risk += 2.0;
    }
    let bug_risk = 10.0 - risk;

    let mut devops = 10.0
        - f64::from(report.container_issues()) * 2.0
        - f64::from(report.workflow_errors()) * 1.5;
    match ci.status {
        CiStatus::Success => devops += 1.0,
        CiStatus::NoWorkflows => devops -= 2.0,
        _ => {}
    }

    let delivery_speed = match m.changed_lines {
        0..=200 => 9.0,
        201..=400 => 8.0,
        401..=800 => 6.0,
        801..=1000 => 5.0,
        _ => 4.0,
    };

    let mut testing = 3.0;
    if m.test_files_changed > 0 {
        testing += 4.0;
    }
    if ci.tests_passed + ci.tests_failed > 0 {
        testing += 3.0 * (1.0 - ci.test_failure_rate());
    }

    let mut documentation = 3.0;
    if m.doc_files_changed > 0 {
        documentation += 3.0;
    }
    documentation += (m.description_length.min(200) as f64) / 50.0;

    let mut collaboration = 4.0;
    if m.description_length >= 50 {
        collaboration += 3.0;
    }
    if m.description_length >= 200 {
        collaboration += 2.0;
    }
    if m.commit_count >= 2 {
        collaboration += 1.0;
    }

    let mut architecture = 7.0;
    if m.changed_files > 0 {
        let avg_lines = m.changed_lines as f64 / m.changed_files as f64;
        if avg_lines <= 150.0 {
            architecture += 1.0;
        } else if avg_lines > 300.0 {
            architecture -= 2.0;
        }
    }

    CategoryScores {
        code_quality,
        testing,
        documentation,
        security,
        devops,
        bug_risk,
        delivery_speed,
        collaboration,
        git_maturity: m.git_score,
        architecture,
    }
    .clamped()
}

/// Weighted blend of LLM and deterministic scores, per category.
pub fn fuse(llm: &CategoryScores, det: &CategoryScores) -> CategoryScores {
    let l = llm.as_array();
    let d = det.as_array();
    let mut out = [0.0; 10];
    for i in 0..10 {
        out[i] = FUSION_LLM_WEIGHT * l[i] + (1.0 - FUSION_LLM_WEIGHT) * d[i];
    }
    CategoryScores {
        code_quality: out[0],
        testing: out[1],
        documentation: out[2],
        security: out[3],
        devops: out[4],
        bug_risk: out[5],
        delivery_speed: out[6],
        collaboration: out[7],
        git_maturity: out[8],
        architecture: out[9],
    }
}

/// Hard ceilings and floors, applied in a fixed order after fusion.
/// Each rule is independent of the others.
pub fn apply_overrides(
    mut scores: CategoryScores,
    report: &StaticReport,
    ci: &CiReport,
) -> CategoryScores {
    if report.secret_hits() > 0 {
        scores.security = 0.0;
    }

    if ci.status == CiStatus::Failure {
        scores.bug_risk = scores.bug_risk.min(3.0);
        scores.delivery_speed = scores.delivery_speed.min(4.0);
    }

    if report.lint_errors() > LINT_ERROR_HARD_CAP_THRESHOLD {
        scores.code_quality = scores.code_quality.min(4.0);
    }

    if report.container_unsafe() > 0 {
        scores.devops = scores.devops.min(5.0);
    }

    if report.metrics.oversized() {
        scores.delivery_speed -= 2.0;
    }

    if report.metrics.git_score < 4.0 {
        scores.git_maturity = scores.git_maturity.min(report.metrics.git_score);
    }

    if report.workflow_errors() > 0 {
        scores.devops = scores.devops.min(6.0);
    }

    scores.clamped()
}

/// Human-readable evidence lines for display next to the score.
/// Derived data only; nothing here feeds back into scoring.
pub fn evidence(report: &StaticReport, ci: &CiReport) -> Vec<String> {
    let mut lines = Vec::new();

    lines.push(format!(
        "Lint: {} errors, {} warnings",
        report.lint_errors(),
        report.lint_warnings()
    ));

    match ci.status {
        CiStatus::NoWorkflows => lines.push("CI: no workflows configured".to_string()),
        CiStatus::Unknown => lines.push("CI: status unknown".to_string()),
        status => {
            let label = match status {
                CiStatus::Success => "passed",
                CiStatus::Failure => "failed",
                CiStatus::Cancelled => "cancelled",
                _ => unreachable!(),
            };
            lines.push(format!(
                "CI: {} ({} passed / {} failed tests, {}s)",
                label, ci.tests_passed, ci.tests_failed, ci.duration_secs
            ));
        }
    }

    if report.container_issues() > 0 {
        lines.push(format!(
            "Container files: {} issues ({} unsafe)",
            report.container_issues(),
            report.container_unsafe()
        ));
    }
    if report.workflow_errors() > 0 {
        lines.push(format!(
            "Workflow YAML: {} invalid file(s)",
            report.workflow_errors()
        ));
    }
    if report.secret_hits() > 0 {
        lines.push(format!(
            "Secrets: {} potential credential(s) detected",
            report.secret_hits()
        ));
    }

    let m = &report.metrics;
    lines.push(format!(
        "PR size: {} changed lines across {} files{}",
        m.changed_lines,
        m.changed_files,
        if m.oversized() { " (oversized)" } else { "" }
    ));

    lines
}

/// Full scoring path: fuse, override, clamp, round, total, badge, evidence.
pub fn compute_breakdown(
    llm: &LlmReview,
    report: &StaticReport,
    ci: &CiReport,
) -> ScoreBreakdown {
    let det = deterministic_scores(report, ci);
    let fused = fuse(&llm.scores, &det);
    let categories = apply_overrides(fused, report, ci).rounded();
    let total = categories.total();

    ScoreBreakdown {
        total,
        badge: Badge::from_total(total),
        evidence: evidence(report, ci),
        summary: llm.summary.clone(),
        suggestions: llm.suggestions.clone(),
        fallback: llm.fallback,
        categories,
    }
}

/// Five-field legacy projection kept for backward compatibility.
///
/// Never persisted and never user-facing; the ten-category model is
/// canonical. Formulas are preserved from the legacy aggregation, including
/// its own (lower) lint-error cap and weighted total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyScores {
    #[serde(rename = "codeQuality")]
    pub code_quality: f64,
    #[serde(rename = "devopsExecution")]
    pub devops_execution: f64,
    pub reliability: f64,
    #[serde(rename = "deliverySpeed")]
    pub delivery_speed: f64,
    pub collaboration: f64,
}

impl LegacyScores {
    pub fn project(fused: &CategoryScores, report: &StaticReport) -> Self {
        let mut code_quality = fused.code_quality;
        if report.lint_errors() > LEGACY_LINT_ERROR_CAP_THRESHOLD {
            code_quality = code_quality.min(5.0);
        }

        Self {
            code_quality,
            devops_execution: fused.devops,
            reliability: (10.0 - fused.bug_risk).clamp(0.0, 10.0),
            delivery_speed: fused.delivery_speed,
            collaboration: ((fused.collaboration + fused.git_maturity) / 2.0).round(),
        }
    }

    /// Legacy weighted total on the 0–100 scale.
    pub fn total(&self) -> u8 {
        let weighted = self.code_quality * 0.30
            + self.devops_execution * 0.20
            + self.reliability * 0.20
            + self.delivery_speed * 0.15
            + self.collaboration * 0.15;
        (weighted * 10.0).round().clamp(0.0, 100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Issue, IssueKind, PrMetrics, Severity};

    fn clean_report() -> StaticReport {
        StaticReport {
            metrics: PrMetrics {
                changed_lines: 150,
                changed_files: 4,
                commit_count: 3,
                description_length: 120,
                test_files_changed: 1,
                doc_files_changed: 1,
                git_score: 9.0,
                ..PrMetrics::default()
            },
            ..StaticReport::default()
        }
    }

    fn passing_ci() -> CiReport {
        CiReport {
            status: CiStatus::Success,
            tests_passed: 10,
            tests_failed: 0,
            duration_secs: 120,
        }
    }

    fn failing_ci() -> CiReport {
        CiReport {
            status: CiStatus::Failure,
            tests_passed: 4,
            tests_failed: 6,
            duration_secs: 300,
        }
    }

    fn lint_issues(errors: u32) -> Vec<Issue> {
        (0..errors)
            .map(|i| Issue {
                kind: IssueKind::Lint,
                severity: Severity::Error,
                file: "src/app.js".into(),
                line: Some(i as usize + 1),
                message: "x".into(),
            })
            .collect()
    }

    fn secret_issue() -> Issue {
        Issue {
            kind: IssueKind::Secret,
            severity: Severity::Error,
            file: ".env".into(),
            line: Some(1),
            message: "possible assigned credential".into(),
        }
    }

    fn good_llm() -> LlmReview {
        LlmReview {
            scores: CategoryScores::uniform(9.0),
            summary: "Strong work.".into(),
            suggestions: vec!["Split the largest module".into()],
            fallback: false,
        }
    }

    #[test]
    fn badge_thresholds_match_contract() {
        assert_eq!(Badge::from_total(75), Badge::Green);
        assert_eq!(Badge::from_total(100), Badge::Green);
        assert_eq!(Badge::from_total(74), Badge::Yellow);
        assert_eq!(Badge::from_total(50), Badge::Yellow);
        assert_eq!(Badge::from_total(49), Badge::Red);
        assert_eq!(Badge::from_total(0), Badge::Red);
    }

    #[test]
    fn total_is_sum_of_rounded_categories_in_range() {
        let breakdown = compute_breakdown(&good_llm(), &clean_report(), &passing_ci());
        let expected: f64 = breakdown.categories.as_array().iter().sum();
        assert_eq!(breakdown.total, expected as u8);
        assert!(breakdown.total <= 100);
    }

    #[test]
    fn any_secret_forces_security_to_zero() {
        let mut report = clean_report();
        report.issues.push(secret_issue());
        let breakdown = compute_breakdown(&good_llm(), &report, &passing_ci());
        assert_eq!(breakdown.categories.security, 0.0);
    }

    #[test]
    fn failing_ci_caps_bug_risk_and_delivery_speed() {
        let breakdown = compute_breakdown(&good_llm(), &clean_report(), &failing_ci());
        assert!(breakdown.categories.bug_risk <= 3.0);
        assert!(breakdown.categories.delivery_speed <= 4.0);
    }

    #[test]
    fn sixty_lint_errors_cap_code_quality() {
        let mut report = clean_report();
        report.issues = lint_issues(60);
        let breakdown = compute_breakdown(&good_llm(), &report, &passing_ci());
        assert!(breakdown.categories.code_quality <= 4.0);
    }

    #[test]
    fn fifty_lint_errors_do_not_trigger_the_hard_cap() {
        let mut report = clean_report();
        report.issues = lint_issues(50);
        let det = deterministic_scores(&report, &passing_ci());
        let fused = fuse(&good_llm().scores, &det);
        let overridden = apply_overrides(fused.clone(), &report, &passing_ci());
        // The rule fires strictly above the threshold; at 50 the score is
        // whatever fusion produced.
        assert_eq!(overridden.code_quality, fused.code_quality.clamp(0.0, 10.0));
    }

    #[test]
    fn unsafe_container_findings_cap_devops() {
        let mut report = clean_report();
        report.issues.push(Issue {
            kind: IssueKind::Container,
            severity: Severity::Error,
            file: "Dockerfile".into(),
            line: Some(2),
            message: "container runs as root".into(),
        });
        let breakdown = compute_breakdown(&good_llm(), &report, &passing_ci());
        assert!(breakdown.categories.devops <= 5.0);
    }

    #[test]
    fn workflow_errors_cap_devops_at_six() {
        let mut report = clean_report();
        report.issues.push(Issue {
            kind: IssueKind::Workflow,
            severity: Severity::Error,
            file: ".github/workflows/ci.yml".into(),
            line: Some(3),
            message: "invalid YAML".into(),
        });
        let breakdown = compute_breakdown(&good_llm(), &report, &passing_ci());
        assert!(breakdown.categories.devops <= 6.0);
    }

    #[test]
    fn oversized_pr_subtracts_from_delivery_speed() {
        let mut report = clean_report();
        report.metrics.changed_lines = 1500;
        let small = compute_breakdown(&good_llm(), &clean_report(), &passing_ci());
        let large = compute_breakdown(&good_llm(), &report, &passing_ci());
        assert!(large.categories.delivery_speed < small.categories.delivery_speed);
    }

    #[test]
    fn poor_git_hygiene_caps_git_maturity() {
        let mut report = clean_report();
        report.metrics.git_score = 2.0;
        let breakdown = compute_breakdown(&good_llm(), &report, &passing_ci());
        assert!(breakdown.categories.git_maturity <= 2.0);
    }

    #[test]
    fn fusion_weights_concentrate_on_the_llm() {
        let llm = CategoryScores::uniform(10.0);
        let det = CategoryScores::uniform(0.0);
        let fused = fuse(&llm, &det);
        assert!((fused.code_quality - 7.0).abs() < 1e-9);
    }

    #[test]
    fn deterministic_security_is_binary() {
        let mut report = clean_report();
        assert_eq!(deterministic_scores(&report, &passing_ci()).security, 10.0);
        report.issues.push(secret_issue());
        assert_eq!(deterministic_scores(&report, &passing_ci()).security, 0.0);
    }

    #[test]
    fn all_categories_stay_in_range_under_worst_case() {
        let mut report = clean_report();
        report.issues = lint_issues(200);
        report.issues.push(secret_issue());
        report.metrics.changed_lines = 9000;
        report.metrics.git_score = 0.0;
        let breakdown = compute_breakdown(&LlmReview::neutral_fallback(), &report, &failing_ci());
        for value in breakdown.categories.as_array() {
            assert!((0.0..=10.0).contains(&value), "out of range: {}", value);
        }
        assert!(breakdown.total <= 100);
    }

    #[test]
    fn legacy_reliability_is_complement_of_bug_risk() {
        let fused = CategoryScores {
            bug_risk: 8.0,
            ..CategoryScores::uniform(7.0)
        };
        let legacy = LegacyScores::project(&fused, &clean_report());
        assert_eq!(legacy.reliability, 2.0);
    }

    #[test]
    fn legacy_collaboration_averages_collaboration_and_git_maturity() {
        let fused = CategoryScores {
            collaboration: 6.0,
            git_maturity: 9.0,
            ..CategoryScores::uniform(5.0)
        };
        let legacy = LegacyScores::project(&fused, &clean_report());
        assert_eq!(legacy.collaboration, 8.0);
    }

    #[test]
    fn legacy_lint_cap_fires_at_its_lower_threshold() {
        let mut report = clean_report();
        report.issues = lint_issues(21);
        let fused = CategoryScores::uniform(9.0);
        let legacy = LegacyScores::project(&fused, &report);
        assert!(legacy.code_quality <= 5.0);
        // The canonical path does not cap at this count.
        let overridden = apply_overrides(fused, &report, &passing_ci());
        assert!(overridden.code_quality > 5.0);
    }

    #[test]
    fn evidence_mentions_lint_ci_and_size() {
        let lines = evidence(&clean_report(), &passing_ci());
        assert!(lines.iter().any(|l| l.starts_with("Lint:")));
        assert!(lines.iter().any(|l| l.starts_with("CI: passed")));
        assert!(lines.iter().any(|l| l.starts_with("PR size:")));
    }
}
