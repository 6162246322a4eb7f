//! YAML-syntax validity pass for workflow-like files.
//!
//! Only the added content is validated, so an edit that touches part of a
//! workflow is checked against the hunk text rather than the full file.
//! A hunk that does not parse standalone but starts mid-document is skipped
//! (its first added line is indented).

use super::{Analyzer, AnalyzerError, BoundedFile, Issue, IssueKind, Severity};

fn is_workflow_file(file: &BoundedFile) -> bool {
    let yaml = matches!(file.extension(), Some("yml") | Some("yaml"));
    yaml && (file.path.contains(".github/workflows/")
        || file.path.contains(".gitlab-ci")
        || file.file_name().starts_with("docker-compose")
        || file.file_name() == "ci.yml"
        || file.file_name() == "ci.yaml")
}

pub struct WorkflowAnalyzer;

impl Analyzer for WorkflowAnalyzer {
    fn name(&self) -> &'static str {
        "workflow"
    }

    fn analyze(&self, files: &[BoundedFile]) -> Result<Vec<Issue>, AnalyzerError> {
        let mut issues = Vec::new();

        for file in files.iter().filter(|f| is_workflow_file(f)) {
            let content = file.added_content();
            if content.trim().is_empty() {
                continue;
            }
            // Partial hunks from mid-document edits rarely parse standalone.
            if content.lines().next().is_some_and(|l| l.starts_with(' ')) {
                continue;
            }

            if let Err(e) = serde_yaml::from_str::<serde_yaml::Value>(&content) {
                issues.push(Issue {
                    kind: IssueKind::Workflow,
                    severity: Severity::Error,
                    file: file.path.clone(),
                    line: e.location().map(|l| l.line()),
                    message: format!("invalid YAML: {}", e),
                });
            }
        }

        Ok(issues)
    }
}
