//! Container-file heuristics: root-user usage, unclean package caches,
//! inline secrets, unpinned base images.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Analyzer, AnalyzerError, BoundedFile, Issue, IssueKind, Severity};

static INLINE_SECRET_ENV: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^(ENV|ARG)\s+\w*(PASSWORD|SECRET|TOKEN|API_?KEY)\w*\s*[= ]\s*\S"#).unwrap()
});

static APT_INSTALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)apt(-get)?\s+install").unwrap());

static CACHE_CLEAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(rm\s+-rf\s+/var/lib/apt/lists|apt(-get)?\s+clean|--no-install-recommends)")
        .unwrap()
});

static LATEST_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^FROM\s+\S+:latest(\s|$)").unwrap());

fn is_container_file(file: &BoundedFile) -> bool {
    let name = file.file_name();
    name == "Dockerfile" || name.starts_with("Dockerfile.") || name.ends_with(".dockerfile")
}

pub struct ContainerAnalyzer;

impl Analyzer for ContainerAnalyzer {
    fn name(&self) -> &'static str {
        "container"
    }

    fn analyze(&self, files: &[BoundedFile]) -> Result<Vec<Issue>, AnalyzerError> {
        let mut issues = Vec::new();

        for file in files.iter().filter(|f| is_container_file(f)) {
            let added: Vec<&str> = file.added_lines().collect();
            let mut saw_user_directive = false;

            for (idx, line) in added.iter().enumerate() {
                let trimmed = line.trim();
                let upper = trimmed.to_uppercase();

                if upper.starts_with("USER ") {
                    saw_user_directive = true;
                    if upper == "USER ROOT" || upper == "USER 0" {
                        issues.push(issue(
                            file,
                            idx,
                            Severity::Error,
                            "container runs as root",
                        ));
                    }
                }
                if INLINE_SECRET_ENV.is_match(trimmed) {
                    issues.push(issue(
                        file,
                        idx,
                        Severity::Error,
                        "credential baked into image via ENV/ARG",
                    ));
                }
                if APT_INSTALL.is_match(trimmed) && !CACHE_CLEAN.is_match(trimmed) {
                    issues.push(issue(
                        file,
                        idx,
                        Severity::Warning,
                        "package install layer leaves the apt cache in the image",
                    ));
                }
                if LATEST_TAG.is_match(trimmed) {
                    issues.push(issue(
                        file,
                        idx,
                        Severity::Warning,
                        "base image pinned to :latest",
                    ));
                }
            }

            // A new Dockerfile that never drops privileges runs as root.
            let adds_from = added
                .iter()
                .any(|l| l.trim().to_uppercase().starts_with("FROM "));
            if adds_from && !saw_user_directive {
                issues.push(Issue {
                    kind: IssueKind::Container,
                    severity: Severity::Error,
                    file: file.path.clone(),
                    line: None,
                    message: "no USER directive; container defaults to root".into(),
                });
            }
        }

        Ok(issues)
    }
}

fn issue(file: &BoundedFile, idx: usize, severity: Severity, message: &str) -> Issue {
    Issue {
        kind: IssueKind::Container,
        severity,
        file: file.path.clone(),
        line: Some(idx + 1),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dockerfile(lines: &[&str]) -> BoundedFile {
        let patch: String = lines.iter().map(|l| format!("+{}\n", l)).collect();
        BoundedFile::bound("Dockerfile".into(), &patch, lines.len(), 400)
    }

    fn run(file: BoundedFile) -> Vec<Issue> {
        ContainerAnalyzer.analyze(&[file]).unwrap()
    }

    #[test]
    fn explicit_root_user_is_an_error() {
        let issues = run(dockerfile(&["FROM node:20", "USER root"]));
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Error && i.message.contains("root")));
    }

    #[test]
    fn missing_user_directive_is_an_error() {
        let issues = run(dockerfile(&["FROM node:20", "COPY . ."]));
        assert!(issues.iter().any(|i| i.message.contains("no USER directive")));
    }

    #[test]
    fn non_root_user_passes() {
        let issues = run(dockerfile(&["FROM node:20", "USER node"]));
        assert!(issues.iter().all(|i| i.severity != Severity::Error));
    }

    #[test]
    fn inline_secret_env_is_an_error() {
        let issues = run(dockerfile(&["FROM node:20", "USER node", "ENV API_KEY=abc123"]));
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Error && i.message.contains("credential")));
    }

    #[test]
    fn apt_install_without_cleanup_is_a_warning() {
        let issues = run(dockerfile(&[
            "FROM debian:12",
            "USER app",
            "RUN apt-get install -y curl",
        ]));
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Warning && i.message.contains("apt cache")));
    }

    #[test]
    fn apt_install_with_cleanup_passes() {
        let issues = run(dockerfile(&[
            "FROM debian:12",
            "USER app",
            "RUN apt-get install -y curl && rm -rf /var/lib/apt/lists/*",
        ]));
        assert!(!issues.iter().any(|i| i.message.contains("apt cache")));
    }

    #[test]
    fn non_container_files_are_ignored() {
        let patch = "+USER root\n";
        let file = BoundedFile::bound("src/main.rs".into(), patch, 1, 400);
        assert!(ContainerAnalyzer.analyze(&[file]).unwrap().is_empty());
    }
}
