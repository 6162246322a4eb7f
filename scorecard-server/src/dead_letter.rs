//! Append-only dead-letter store.
//!
//! The single source of truth for "what permanently failed and why". A
//! silently lost job here means a student submission stuck forever, so
//! records are never deleted — there is deliberately no delete operation in
//! this module.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;

use crate::db::{now_ts, Database};

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub stack: Option<String>,
    pub submission_id: Option<String>,
    pub pr_number: Option<u64>,
    pub created_at: String,
}

/// Append a failed job's payload and failure metadata.
pub fn append(
    db: &Database,
    queue: &str,
    payload: &serde_json::Value,
    reason: &str,
    stack: Option<&str>,
    submission_id: Option<&str>,
    pr_number: Option<u64>,
) -> Result<i64> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO dead_letters
                 (queue, payload, reason, stack, submission_id, pr_number, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                queue,
                payload.to_string(),
                reason,
                stack,
                submission_id,
                pr_number,
                now_ts()
            ],
        )
        .context("insert dead letter")?;
        Ok(conn.last_insert_rowid())
    })
}

/// Records for one submission, newest first. Operator triage entry point.
pub fn list_for_submission(db: &Database, submission_id: &str) -> Result<Vec<DeadLetterRecord>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, queue, payload, reason, stack, submission_id, pr_number, created_at
             FROM dead_letters WHERE submission_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![submission_id], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("query dead letters for submission")
    })
}

pub fn list_recent(db: &Database, limit: u32) -> Result<Vec<DeadLetterRecord>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, queue, payload, reason, stack, submission_id, pr_number, created_at
             FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("query recent dead letters")
    })
}

pub fn count(db: &Database) -> Result<u64> {
    db.with_conn(|conn| {
        conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .context("count dead letters")
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    let payload: String = row.get(2)?;
    Ok(DeadLetterRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        reason: row.get(3)?,
        stack: row.get(4)?,
        submission_id: row.get(5)?,
        pr_number: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
        created_at: row.get(7)?,
    })
}
