//! SQLite persistence for the pipeline's domain records.
//!
//! Holds the write contract for submissions, reviews, scores, notifications,
//! installation linkage and portfolio artifacts, plus the tables owned by
//! the queue broker (`queue` module) and the dead-letter store. Everything
//! keyed by a natural key is an upsert so that duplicate job delivery cannot
//! corrupt state.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration function in `run_migrations`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use scorecard_core::score::ScoreBreakdown;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// RFC 3339 timestamp with fixed millisecond precision, so stored
/// timestamps compare correctly as text.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Canonical `owner/name` slug for a repository URL, tolerant of the usual
/// clone-URL spellings.
pub fn normalize_repo_url(url: &str) -> String {
    let mut s = url.trim().to_lowercase();
    for prefix in ["https://", "http://", "git@", "ssh://git@"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }
    let s = s.replacen(':', "/", 1);
    let s = s.trim_start_matches("github.com/").trim_start_matches("www.github.com/");
    s.trim_end_matches('/').trim_end_matches(".git").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Started,
    UnderReview,
    Reviewed,
    PortfolioReady,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Started => "started",
            SubmissionStatus::UnderReview => "under_review",
            SubmissionStatus::Reviewed => "reviewed",
            SubmissionStatus::PortfolioReady => "portfolio_ready",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "under_review" => SubmissionStatus::UnderReview,
            "reviewed" => SubmissionStatus::Reviewed,
            "portfolio_ready" => SubmissionStatus::PortfolioReady,
            _ => SubmissionStatus::Started,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub repo_url: String,
    /// GitHub user id of the submission owner, when known.
    pub platform_user_id: Option<u64>,
    pub pr_number: Option<u64>,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone)]
pub struct PortfolioRecord {
    pub submission_id: String,
    pub share_token: String,
    pub summary: String,
    pub total: u8,
    pub badge: String,
}

/// SQLite database shared by the domain store, queue broker and dead-letter
/// store.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// Async callers go through [`Store::run`], which wraps the blocking call
/// in `tokio::task::spawn_blocking`.
pub struct Database {
    conn: Mutex<Connection>,
}

/// Shared async handle over the database.
#[derive(Clone)]
pub struct Store(Arc<Database>);

impl Store {
    pub fn new(db: Database) -> Self {
        Self(Arc::new(db))
    }

    /// Run a blocking database operation from async code.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.0.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("spawn_blocking panicked")?
    }
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Run a closure with the locked connection. Crate-internal so the
    /// queue and dead-letter modules can own their queries.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("mutex poisoned");
        f(&conn)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            let current_version: i32 =
                conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

            if current_version > SCHEMA_VERSION {
                anyhow::bail!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    current_version,
                    SCHEMA_VERSION
                );
            }

            if current_version < SCHEMA_VERSION {
                Self::run_migrations(conn, current_version)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            Ok(())
        })
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                repo_url TEXT NOT NULL,
                repo_slug TEXT NOT NULL,
                platform_user_id INTEGER,
                pr_number INTEGER,
                status TEXT NOT NULL DEFAULT 'started',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_submissions_repo_slug
                ON submissions(repo_slug);

            CREATE TABLE IF NOT EXISTS pr_reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                submission_id TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                llm_payload TEXT,
                static_report TEXT NOT NULL,
                suggestions TEXT NOT NULL DEFAULT '[]',
                fallback INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pr_reviews_submission
                ON pr_reviews(submission_id);

            CREATE TABLE IF NOT EXISTS scores (
                submission_id TEXT PRIMARY KEY,
                code_quality INTEGER NOT NULL,
                testing INTEGER NOT NULL,
                documentation INTEGER NOT NULL,
                security INTEGER NOT NULL,
                devops_execution INTEGER NOT NULL,
                bug_risk INTEGER NOT NULL,
                delivery_speed INTEGER NOT NULL,
                collaboration INTEGER NOT NULL,
                git_maturity INTEGER NOT NULL,
                architecture INTEGER NOT NULL,
                total INTEGER NOT NULL,
                badge TEXT NOT NULL,
                details TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                body TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                email_sent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_user
                ON notifications(user_id);

            CREATE TABLE IF NOT EXISTS notification_preferences (
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (user_id, event_type)
            );

            CREATE TABLE IF NOT EXISTS installations (
                installation_id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL,
                account_login TEXT NOT NULL,
                user_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS portfolios (
                submission_id TEXT PRIMARY KEY,
                share_token TEXT NOT NULL,
                summary TEXT NOT NULL,
                total INTEGER NOT NULL,
                badge TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN (
                    'queued', 'active', 'completed', 'dead'
                )),
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                run_at TEXT NOT NULL,
                claimed_by TEXT,
                claimed_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_queue_status
                ON jobs(queue, status, run_at);

            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                stack TEXT,
                submission_id TEXT,
                pr_number INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dead_letters_submission
                ON dead_letters(submission_id);
            "#,
        )
        .context("Failed to create initial schema")?;
        Ok(())
    }

    // ── Submissions ──────────────────────────────────────────────────────

    pub fn create_submission(
        &self,
        id: &str,
        user_id: &str,
        project_id: &str,
        repo_url: &str,
        platform_user_id: Option<u64>,
    ) -> Result<()> {
        let now = now_ts();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO submissions
                     (id, user_id, project_id, repo_url, repo_slug, platform_user_id,
                      status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'started', ?7, ?7)",
                params![
                    id,
                    user_id,
                    project_id,
                    repo_url,
                    normalize_repo_url(repo_url),
                    platform_user_id,
                    now
                ],
            )
            .context("insert submission")?;
            Ok(())
        })
    }

    pub fn find_submission(&self, id: &str) -> Result<Option<Submission>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, project_id, repo_url, platform_user_id, pr_number, status
                 FROM submissions WHERE id = ?1",
                params![id],
                row_to_submission,
            )
            .optional()
            .context("query submission")
        })
    }

    /// All submissions registered against a repository, newest first.
    pub fn find_submissions_by_repo(&self, repo_url: &str) -> Result<Vec<Submission>> {
        let slug = normalize_repo_url(repo_url);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, project_id, repo_url, platform_user_id, pr_number, status
                 FROM submissions WHERE repo_slug = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![slug], row_to_submission)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .context("query submissions by repo")
        })
    }

    pub fn find_submission_by_repo_and_pr(
        &self,
        repo_url: &str,
        pr_number: u64,
    ) -> Result<Option<Submission>> {
        let slug = normalize_repo_url(repo_url);
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, project_id, repo_url, platform_user_id, pr_number, status
                 FROM submissions WHERE repo_slug = ?1 AND pr_number = ?2",
                params![slug, pr_number],
                row_to_submission,
            )
            .optional()
            .context("query submission by repo and pr")
        })
    }

    /// Attach a PR number if none is attached yet. The number is immutable
    /// after first attach; returns whether this call attached it.
    pub fn attach_pr_number(&self, submission_id: &str, pr_number: u64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE submissions SET pr_number = ?1, updated_at = ?2
                 WHERE id = ?3 AND pr_number IS NULL",
                params![pr_number, now_ts(), submission_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE submissions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_ts(), submission_id],
            )?;
            Ok(())
        })
    }

    // ── Reviews & scores ─────────────────────────────────────────────────

    /// Append a review record. `llm_payload` is None for the static-only
    /// partial record persisted when the job dies after analysis.
    pub fn insert_pr_review(
        &self,
        submission_id: &str,
        pr_number: u64,
        llm_payload: Option<&serde_json::Value>,
        static_report: &serde_json::Value,
        suggestions: &[String],
        fallback: bool,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pr_reviews
                     (submission_id, pr_number, llm_payload, static_report,
                      suggestions, fallback, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    submission_id,
                    pr_number,
                    llm_payload.map(|v| v.to_string()),
                    static_report.to_string(),
                    serde_json::to_string(suggestions)?,
                    fallback,
                    now_ts()
                ],
            )
            .context("insert pr_review")?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn count_pr_reviews(&self, submission_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM pr_reviews WHERE submission_id = ?1",
                params![submission_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .context("count pr_reviews")
        })
    }

    pub fn latest_pr_review_has_llm(&self, submission_id: &str) -> Result<Option<bool>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT llm_payload IS NOT NULL FROM pr_reviews
                 WHERE submission_id = ?1 ORDER BY id DESC LIMIT 1",
                params![submission_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .context("query latest pr_review")
        })
    }

    /// Upsert the current score for a submission, keyed by submission id.
    pub fn upsert_score(&self, submission_id: &str, breakdown: &ScoreBreakdown) -> Result<()> {
        let c = &breakdown.categories;
        let details = serde_json::to_string(breakdown)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scores
                     (submission_id, code_quality, testing, documentation, security,
                      devops_execution, bug_risk, delivery_speed, collaboration,
                      git_maturity, architecture, total, badge, details, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(submission_id) DO UPDATE SET
                     code_quality = excluded.code_quality,
                     testing = excluded.testing,
                     documentation = excluded.documentation,
                     security = excluded.security,
                     devops_execution = excluded.devops_execution,
                     bug_risk = excluded.bug_risk,
                     delivery_speed = excluded.delivery_speed,
                     collaboration = excluded.collaboration,
                     git_maturity = excluded.git_maturity,
                     architecture = excluded.architecture,
                     total = excluded.total,
                     badge = excluded.badge,
                     details = excluded.details,
                     updated_at = excluded.updated_at",
                params![
                    submission_id,
                    c.code_quality as i64,
                    c.testing as i64,
                    c.documentation as i64,
                    c.security as i64,
                    c.devops as i64,
                    c.bug_risk as i64,
                    c.delivery_speed as i64,
                    c.collaboration as i64,
                    c.git_maturity as i64,
                    c.architecture as i64,
                    breakdown.total,
                    breakdown.badge.as_str(),
                    details,
                    now_ts()
                ],
            )
            .context("upsert score")?;
            Ok(())
        })
    }

    pub fn get_score(&self, submission_id: &str) -> Result<Option<ScoreBreakdown>> {
        self.with_conn(|conn| {
            let details: Option<String> = conn
                .query_row(
                    "SELECT details FROM scores WHERE submission_id = ?1",
                    params![submission_id],
                    |row| row.get(0),
                )
                .optional()
                .context("query score")?;
            match details {
                Some(json) => Ok(Some(
                    serde_json::from_str(&json).context("parse stored score details")?,
                )),
                None => Ok(None),
            }
        })
    }

    pub fn count_scores(&self, submission_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM scores WHERE submission_id = ?1",
                params![submission_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .context("count scores")
        })
    }

    // ── Notifications ────────────────────────────────────────────────────

    pub fn insert_notification(
        &self,
        id: &str,
        user_id: &str,
        event_type: &str,
        body: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            // Keyed by the caller-supplied id so a re-delivered job reuses
            // its deterministic id instead of inserting twice.
            conn.execute(
                "INSERT OR IGNORE INTO notifications
                     (id, user_id, event_type, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, user_id, event_type, body, now_ts()],
            )
            .context("insert notification")?;
            Ok(())
        })
    }

    pub fn mark_email_sent(&self, notification_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE notifications SET email_sent = 1 WHERE id = ?1",
                params![notification_id],
            )?;
            Ok(())
        })
    }

    pub fn notification_email_sent(&self, notification_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT email_sent FROM notifications WHERE id = ?1",
                params![notification_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map(|v| v.unwrap_or(false))
            .context("query notification email_sent")
        })
    }

    pub fn count_notifications(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .context("count notifications")
        })
    }

    /// Whether email is enabled for (user, event type). A missing row
    /// defaults to enabled.
    pub fn notification_preference(&self, user_id: &str, event_type: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT enabled FROM notification_preferences
                 WHERE user_id = ?1 AND event_type = ?2",
                params![user_id, event_type],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map(|v| v.unwrap_or(true))
            .context("query notification preference")
        })
    }

    pub fn set_notification_preference(
        &self,
        user_id: &str,
        event_type: &str,
        enabled: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notification_preferences (user_id, event_type, enabled)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, event_type) DO UPDATE SET enabled = excluded.enabled",
                params![user_id, event_type, enabled],
            )?;
            Ok(())
        })
    }

    // ── Installations ────────────────────────────────────────────────────

    pub fn upsert_installation(
        &self,
        installation_id: u64,
        account_id: u64,
        account_login: &str,
        user_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO installations
                     (installation_id, account_id, account_login, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(installation_id) DO UPDATE SET
                     account_id = excluded.account_id,
                     account_login = excluded.account_login,
                     user_id = COALESCE(excluded.user_id, installations.user_id)",
                params![installation_id, account_id, account_login, user_id, now_ts()],
            )
            .context("upsert installation")?;
            Ok(())
        })
    }

    pub fn link_installation_user(&self, installation_id: u64, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE installations SET user_id = ?1 WHERE installation_id = ?2",
                params![user_id, installation_id],
            )?;
            Ok(())
        })
    }

    pub fn remove_installation(&self, installation_id: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM installations WHERE installation_id = ?1",
                params![installation_id],
            )?;
            Ok(())
        })
    }

    /// Newest installation linked to a user, for the manual discovery path.
    pub fn installation_for_user(&self, user_id: &str) -> Result<Option<u64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT installation_id FROM installations
                 WHERE user_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.map(|n| n as u64))
            .context("query installation for user")
        })
    }

    pub fn installation_user(&self, installation_id: u64) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id FROM installations WHERE installation_id = ?1",
                params![installation_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
            .context("query installation user")
        })
    }

    // ── Portfolios ───────────────────────────────────────────────────────

    /// Upsert the shareable artifact for a submission. The share token is
    /// kept stable across re-deliveries.
    pub fn upsert_portfolio(&self, record: &PortfolioRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO portfolios
                     (submission_id, share_token, summary, total, badge, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(submission_id) DO UPDATE SET
                     summary = excluded.summary,
                     total = excluded.total,
                     badge = excluded.badge",
                params![
                    record.submission_id,
                    record.share_token,
                    record.summary,
                    record.total,
                    record.badge,
                    now_ts()
                ],
            )
            .context("upsert portfolio")?;
            Ok(())
        })
    }

    pub fn get_portfolio(&self, submission_id: &str) -> Result<Option<PortfolioRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT submission_id, share_token, summary, total, badge
                 FROM portfolios WHERE submission_id = ?1",
                params![submission_id],
                |row| {
                    Ok(PortfolioRecord {
                        submission_id: row.get(0)?,
                        share_token: row.get(1)?,
                        summary: row.get(2)?,
                        total: row.get::<_, i64>(3)? as u8,
                        badge: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("query portfolio")
        })
    }
}

fn row_to_submission(row: &rusqlite::Row<'_>) -> rusqlite::Result<Submission> {
    Ok(Submission {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_id: row.get(2)?,
        repo_url: row.get(3)?,
        platform_user_id: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        pr_number: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        status: SubmissionStatus::from_str(&row.get::<_, String>(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scorecard_core::llm::LlmReview;
    use scorecard_core::score::compute_breakdown;
    use scorecard_core::{CiReport, StaticReport};
    use serde_json::json;

    fn db_with_submission() -> Database {
        let db = Database::new_in_memory().unwrap();
        db.create_submission(
            "sub-1",
            "user-1",
            "proj-1",
            "https://github.com/student/shop.git",
            Some(42),
        )
        .unwrap();
        db
    }

    fn breakdown() -> ScoreBreakdown {
        compute_breakdown(
            &LlmReview::neutral_fallback(),
            &StaticReport::default(),
            &CiReport::no_workflows(),
        )
    }

    #[test]
    fn normalize_repo_url_variants() {
        for url in [
            "https://github.com/Student/Shop",
            "https://github.com/student/shop.git",
            "git@github.com:student/shop.git",
            "http://github.com/student/shop/",
        ] {
            assert_eq!(normalize_repo_url(url), "student/shop", "url: {}", url);
        }
    }

    #[test]
    fn pr_number_is_immutable_after_first_attach() {
        let db = db_with_submission();
        assert!(db.attach_pr_number("sub-1", 7).unwrap());
        assert!(!db.attach_pr_number("sub-1", 8).unwrap());
        let sub = db.find_submission("sub-1").unwrap().unwrap();
        assert_eq!(sub.pr_number, Some(7));
    }

    #[test]
    fn find_by_repo_matches_url_spelling_variants() {
        let db = db_with_submission();
        let found = db
            .find_submissions_by_repo("git@github.com:student/shop.git")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "sub-1");
    }

    #[test]
    fn find_by_repo_and_pr() {
        let db = db_with_submission();
        db.attach_pr_number("sub-1", 42).unwrap();
        let found = db
            .find_submission_by_repo_and_pr("https://github.com/student/shop", 42)
            .unwrap();
        assert!(found.is_some());
        assert!(db
            .find_submission_by_repo_and_pr("https://github.com/student/shop", 99)
            .unwrap()
            .is_none());
    }

    #[test]
    fn score_upsert_keeps_one_row_per_submission() {
        let db = db_with_submission();
        db.upsert_score("sub-1", &breakdown()).unwrap();
        db.upsert_score("sub-1", &breakdown()).unwrap();
        assert_eq!(db.count_scores("sub-1").unwrap(), 1);
        let stored = db.get_score("sub-1").unwrap().unwrap();
        assert_eq!(stored.total, breakdown().total);
    }

    #[test]
    fn pr_reviews_are_append_only() {
        let db = db_with_submission();
        let report = json!({"issues": []});
        db.insert_pr_review("sub-1", 7, None, &report, &[], false)
            .unwrap();
        db.insert_pr_review("sub-1", 7, Some(&json!({"codeQuality": 8})), &report, &[], false)
            .unwrap();
        assert_eq!(db.count_pr_reviews("sub-1").unwrap(), 2);
        assert_eq!(db.latest_pr_review_has_llm("sub-1").unwrap(), Some(true));
    }

    #[test]
    fn notification_insert_is_idempotent_by_id() {
        let db = db_with_submission();
        db.insert_notification("n-1", "user-1", "score_ready", "Your score is in")
            .unwrap();
        db.insert_notification("n-1", "user-1", "score_ready", "Your score is in")
            .unwrap();
        assert_eq!(db.count_notifications("user-1").unwrap(), 1);
    }

    #[test]
    fn missing_preference_defaults_to_enabled() {
        let db = db_with_submission();
        assert!(db.notification_preference("user-1", "score_ready").unwrap());
        db.set_notification_preference("user-1", "score_ready", false)
            .unwrap();
        assert!(!db.notification_preference("user-1", "score_ready").unwrap());
    }

    #[test]
    fn installation_linkage_roundtrip() {
        let db = db_with_submission();
        db.upsert_installation(100, 42, "student", None).unwrap();
        assert_eq!(db.installation_user(100).unwrap(), None);
        db.link_installation_user(100, "user-1").unwrap();
        assert_eq!(db.installation_user(100).unwrap(), Some("user-1".into()));
        db.remove_installation(100).unwrap();
        assert_eq!(db.installation_user(100).unwrap(), None);
    }

    #[test]
    fn portfolio_upsert_preserves_share_token() {
        let db = db_with_submission();
        let first = PortfolioRecord {
            submission_id: "sub-1".into(),
            share_token: "tok-1".into(),
            summary: "Nice work".into(),
            total: 80,
            badge: "green".into(),
        };
        db.upsert_portfolio(&first).unwrap();
        let second = PortfolioRecord {
            share_token: "tok-2".into(),
            total: 82,
            ..first.clone()
        };
        db.upsert_portfolio(&second).unwrap();
        let stored = db.get_portfolio("sub-1").unwrap().unwrap();
        assert_eq!(stored.share_token, "tok-1");
        assert_eq!(stored.total, 82);
    }

    #[test]
    fn database_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scorecard.db");

        {
            let db = Database::new(&path).unwrap();
            db.create_submission("sub-1", "user-1", "proj-1", "https://github.com/a/b", None)
                .unwrap();
            db.attach_pr_number("sub-1", 3).unwrap();
        }

        let db = Database::new(&path).unwrap();
        let sub = db.find_submission("sub-1").unwrap().unwrap();
        assert_eq!(sub.pr_number, Some(3));
    }

    #[test]
    fn status_transitions_are_recorded() {
        let db = db_with_submission();
        db.set_submission_status("sub-1", SubmissionStatus::UnderReview)
            .unwrap();
        let sub = db.find_submission("sub-1").unwrap().unwrap();
        assert_eq!(sub.status, SubmissionStatus::UnderReview);
    }
}
