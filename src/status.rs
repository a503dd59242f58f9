//! Per-track status persistence in SQLite.
//!
//! Each run replaces the previous run's rows, so the table always describes
//! the latest batch for that database.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;

use crate::models::{ResultsTally, TrackReport};

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub original_index: usize,
    pub spotify_id: Option<String>,
    pub title: String,
    pub status: String,
    pub reason: Option<String>,
    pub file_path: Option<String>,
}

pub struct StatusStore {
    conn: Connection,
}

impl StatusStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open status database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS track_status (
                original_index INTEGER PRIMARY KEY,
                spotify_id     TEXT,
                title          TEXT NOT NULL,
                status         TEXT NOT NULL,
                reason         TEXT,
                file_path      TEXT,
                recorded_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_track_status_status ON track_status(status);",
        )
        .context("Failed to initialise status schema")?;
        Ok(Self { conn })
    }

    /// Replace stored rows with this batch's reports.
    pub fn record_batch(&mut self, reports: &[TrackReport]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM track_status", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO track_status (original_index, spotify_id, title, status, reason, file_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for report in reports {
                stmt.execute(params![
                    report.original_index as i64,
                    report.spotify_id,
                    report.title,
                    report.result.status(),
                    report.result.reason(),
                    report
                        .result
                        .file_path()
                        .map(|p| p.to_string_lossy().into_owned()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn tally(&self) -> Result<ResultsTally> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM track_status GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut tally = ResultsTally::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = count as usize;
            match status.as_str() {
                "success" => tally.success = count,
                "failed" => tally.failed = count,
                "skipped" => tally.skipped = count,
                "metadata_failed" => tally.metadata_failed = count,
                _ => {}
            }
        }
        Ok(tally)
    }

    /// Rows whose status is not `success`, in original order.
    pub fn unfinished(&self) -> Result<Vec<StatusRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT original_index, spotify_id, title, status, reason, file_path
             FROM track_status
             WHERE status != 'success'
             ORDER BY original_index",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let index: i64 = row.get(0)?;
                Ok(StatusRow {
                    original_index: index as usize,
                    spotify_id: row.get(1)?,
                    title: row.get(2)?,
                    status: row.get(3)?,
                    reason: row.get(4)?,
                    file_path: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
