//! Durable URL frontier backed by SQLite.
//!
//! The frontier is the single source of truth for crawl state: every
//! discovered URL gets exactly one row keyed by the hash of its canonical
//! form. Full URL strings live in an interned side table so the main table
//! stays compact when the same URLs appear as parents and roots of many rows.
//!
//! One process owns the database. Check-out runs inside `BEGIN IMMEDIATE` so
//! a row can never be claimed twice even with concurrent readers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::models::{CheckIn, LinkType, NewUrl, Status, UrlRecord};

#[derive(Debug, Error)]
pub enum FrontierError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unknown url key {0:?}")]
    UnknownKey(String),
}

pub type Result<T> = std::result::Result<T, FrontierError>;

/// Counts of frontier rows by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub todo: u64,
    pub in_progress: u64,
    pub done: u64,
    pub error: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.todo + self.in_progress + self.done + self.error + self.skipped
    }
}

/// SQLite-backed frontier store.
pub struct Frontier {
    db_path: PathBuf,
}

impl Frontier {
    /// Open or create the frontier database.
    pub fn open(db_path: &Path) -> Result<Self> {
        let frontier = Self {
            db_path: db_path.to_path_buf(),
        };
        frontier.init_schema()?;
        Ok(frontier)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            -- Interned URL strings; urls rows reference these by id.
            CREATE TABLE IF NOT EXISTS url_strings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS urls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url_key TEXT NOT NULL UNIQUE,
                url_string_id INTEGER NOT NULL REFERENCES url_strings(id),
                parent_url_string_id INTEGER REFERENCES url_strings(id),
                root_url_string_id INTEGER NOT NULL REFERENCES url_strings(id),
                status TEXT NOT NULL DEFAULT 'todo',
                try_count INTEGER NOT NULL DEFAULT 0,
                level INTEGER NOT NULL DEFAULT 0,
                inline_level INTEGER NOT NULL DEFAULT 0,
                link_type TEXT,
                post_data TEXT,
                referer TEXT,
                status_code INTEGER,
                filename TEXT,
                last_error TEXT,
                discovered_at TEXT NOT NULL,
                completed_at TEXT
            );

            -- Payload digests of recorded responses, for WARC revisit records.
            CREATE TABLE IF NOT EXISTS visits (
                url_string_id INTEGER NOT NULL REFERENCES url_strings(id),
                payload_digest TEXT NOT NULL,
                warc_record_id TEXT NOT NULL,
                PRIMARY KEY (url_string_id, payload_digest)
            );

            CREATE INDEX IF NOT EXISTS idx_urls_status
                ON urls(status);
            CREATE INDEX IF NOT EXISTS idx_urls_checkout
                ON urls(level, id) WHERE status = 'todo';
        "#,
        )?;
        Ok(())
    }

    /// Insert URLs, skipping any whose key is already present.
    ///
    /// The whole batch commits in one transaction; returns the number of rows
    /// actually inserted.
    pub fn add_many(&self, new_urls: &[NewUrl]) -> Result<usize> {
        if new_urls.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;

        for new_url in new_urls {
            let url_id = intern_url(&tx, &new_url.url)?;
            let root_id = intern_url(&tx, &new_url.root_url)?;
            let parent_id = match &new_url.parent_url {
                Some(parent) => Some(intern_url(&tx, parent)?),
                None => None,
            };

            let count = tx.execute(
                r#"
                INSERT OR IGNORE INTO urls (
                    url_key, url_string_id, parent_url_string_id,
                    root_url_string_id, status, level, inline_level,
                    link_type, post_data, referer, discovered_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    new_url.url_key,
                    url_id,
                    parent_id,
                    root_id,
                    Status::Todo.as_str(),
                    new_url.level,
                    new_url.inline_level,
                    new_url.link_type.map(|t| t.as_str()),
                    new_url.post_data,
                    new_url.referer,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            inserted += count;
        }

        tx.commit()?;
        debug!(added = inserted, offered = new_urls.len(), "frontier add");
        Ok(inserted)
    }

    /// Atomically claim the next TODO record, lowest `(level, id)` first.
    ///
    /// Returns `None` when nothing is pending.
    pub fn check_out(&self) -> Result<Option<UrlRecord>> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Option<UrlRecord>> = (|| {
            let record = conn
                .query_row(
                    &format!("{SELECT_RECORD} WHERE u.status = 'todo' ORDER BY u.level, u.id LIMIT 1"),
                    [],
                    row_to_record,
                )
                .optional()?;

            if let Some(mut record) = record {
                conn.execute(
                    "UPDATE urls SET status = 'in_progress' WHERE id = ?",
                    params![record.id],
                )?;
                record.status = Status::InProgress;
                Ok(Some(record))
            } else {
                Ok(None)
            }
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Finish a claimed record with a terminal (or requeued) status.
    pub fn check_in(&self, url_key: &str, status: Status, fields: &CheckIn) -> Result<()> {
        let conn = self.connect()?;

        let completed_at = match status {
            Status::Done | Status::Error | Status::Skipped => Some(Utc::now().to_rfc3339()),
            _ => None,
        };

        let count = conn.execute(
            r#"
            UPDATE urls SET
                status = ?1,
                try_count = try_count + ?2,
                status_code = COALESCE(?3, status_code),
                filename = COALESCE(?4, filename),
                last_error = ?5,
                completed_at = COALESCE(?6, completed_at)
            WHERE url_key = ?7
            "#,
            params![
                status.as_str(),
                if fields.increment_try_count { 1 } else { 0 },
                fields.status_code,
                fields.filename,
                fields.error,
                completed_at,
                url_key,
            ],
        )?;

        if count == 0 {
            return Err(FrontierError::UnknownKey(url_key.to_string()));
        }
        Ok(())
    }

    /// Startup recovery: anything left IN_PROGRESS by a previous run goes
    /// back to TODO.
    pub fn release_in_progress(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn.execute(
            "UPDATE urls SET status = 'todo' WHERE status = 'in_progress'",
            [],
        )?;
        Ok(count)
    }

    /// Fetch one record by its key.
    pub fn get(&self, url_key: &str) -> Result<Option<UrlRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE u.url_key = ?"),
                params![url_key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn count_by_status(&self) -> Result<StatusCounts> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM urls GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            match Status::from_str(&status) {
                Some(Status::Todo) => counts.todo = count,
                Some(Status::InProgress) => counts.in_progress = count,
                Some(Status::Done) => counts.done = count,
                Some(Status::Error) => counts.error = count,
                Some(Status::Skipped) => counts.skipped = count,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Whether any TODO or IN_PROGRESS rows remain.
    pub fn has_work(&self) -> Result<bool> {
        let counts = self.count_by_status()?;
        Ok(counts.todo > 0 || counts.in_progress > 0)
    }

    /// Distinct hostnames seen by the crawl.
    pub fn hostnames(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT s.url FROM urls u JOIN url_strings s ON s.id = u.url_string_id",
        )?;
        let urls = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hosts: Vec<String> = urls
            .iter()
            .filter_map(|u| url::Url::parse(u).ok())
            .filter_map(|u| u.host_str().map(|h| h.to_string()))
            .collect();
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }

    /// Record that a payload digest was written for this URL.
    pub fn add_visit(&self, url: &str, payload_digest: &str, record_id: &str) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let url_id = intern_url(&tx, url)?;
        tx.execute(
            "INSERT OR IGNORE INTO visits (url_string_id, payload_digest, warc_record_id)
             VALUES (?1, ?2, ?3)",
            params![url_id, payload_digest, record_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Look up the original record id for a `(URL, payload digest)` pair.
    ///
    /// A hit means the response should be written as a WARC revisit record.
    pub fn get_revisit_id(&self, url: &str, payload_digest: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let id = conn
            .query_row(
                r#"
                SELECT v.warc_record_id FROM visits v
                JOIN url_strings s ON s.id = v.url_string_id
                WHERE s.url = ?1 AND v.payload_digest = ?2
                "#,
                params![url, payload_digest],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Per-status counts broken down for display.
    pub fn status_report(&self) -> Result<HashMap<String, u64>> {
        let counts = self.count_by_status()?;
        let mut map = HashMap::new();
        map.insert("todo".to_string(), counts.todo);
        map.insert("in_progress".to_string(), counts.in_progress);
        map.insert("done".to_string(), counts.done);
        map.insert("error".to_string(), counts.error);
        map.insert("skipped".to_string(), counts.skipped);
        Ok(map)
    }
}

const SELECT_RECORD: &str = r#"
    SELECT
        u.id, u.url_key, s.url, p.url AS parent_url, r.url AS root_url,
        u.status, u.try_count, u.level, u.inline_level, u.link_type,
        u.post_data, u.referer, u.status_code, u.filename, u.last_error,
        u.discovered_at, u.completed_at
    FROM urls u
    JOIN url_strings s ON s.id = u.url_string_id
    LEFT JOIN url_strings p ON p.id = u.parent_url_string_id
    JOIN url_strings r ON r.id = u.root_url_string_id
"#;

fn intern_url(conn: &Connection, url: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO url_strings (url) VALUES (?)",
        params![url],
    )?;
    conn.query_row(
        "SELECT id FROM url_strings WHERE url = ?",
        params![url],
        |row| row.get(0),
    )
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<UrlRecord> {
    Ok(UrlRecord {
        id: row.get("id")?,
        url_key: row.get("url_key")?,
        url: row.get("url")?,
        parent_url: row.get("parent_url")?,
        root_url: row.get("root_url")?,
        status: Status::from_str(&row.get::<_, String>("status")?).unwrap_or(Status::Todo),
        try_count: row.get::<_, i64>("try_count")? as u32,
        level: row.get::<_, i64>("level")? as u32,
        inline_level: row.get::<_, i64>("inline_level")? as u32,
        link_type: row
            .get::<_, Option<String>>("link_type")?
            .and_then(|s| LinkType::from_str(&s)),
        post_data: row.get("post_data")?,
        referer: row.get("referer")?,
        status_code: row.get::<_, Option<i64>>("status_code")?.map(|c| c as u16),
        filename: row.get("filename")?,
        last_error: row.get("last_error")?,
        discovered_at: parse_datetime(&row.get::<_, String>("discovered_at")?),
        completed_at: row
            .get::<_, Option<String>>("completed_at")?
            .map(|s| parse_datetime(&s)),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urlnorm::UrlInfo;
    use tempfile::tempdir;

    fn new_url(url: &str, level: u32) -> NewUrl {
        let info = UrlInfo::parse(url).unwrap();
        NewUrl {
            level,
            ..NewUrl::seed(&info)
        }
    }

    #[test]
    fn test_add_many_dedups_by_key() {
        let dir = tempdir().unwrap();
        let frontier = Frontier::open(&dir.path().join("crawl.db")).unwrap();

        let urls = vec![
            new_url("http://example.com/a", 0),
            new_url("http://example.com/a", 0),
            new_url("http://example.com/b", 0),
        ];
        assert_eq!(frontier.add_many(&urls).unwrap(), 2);
        // Second batch with a known URL adds nothing new for it.
        assert_eq!(frontier.add_many(&urls[..1]).unwrap(), 0);
    }

    #[test]
    fn test_check_out_order_and_claim() {
        let dir = tempdir().unwrap();
        let frontier = Frontier::open(&dir.path().join("crawl.db")).unwrap();

        frontier
            .add_many(&[
                new_url("http://example.com/deep", 2),
                new_url("http://example.com/shallow", 0),
            ])
            .unwrap();

        let first = frontier.check_out().unwrap().unwrap();
        assert_eq!(first.url, "http://example.com/shallow");
        assert_eq!(first.status, Status::InProgress);

        let second = frontier.check_out().unwrap().unwrap();
        assert_eq!(second.url, "http://example.com/deep");

        assert!(frontier.check_out().unwrap().is_none());
    }

    #[test]
    fn test_check_in_updates_fields() {
        let dir = tempdir().unwrap();
        let frontier = Frontier::open(&dir.path().join("crawl.db")).unwrap();

        frontier.add_many(&[new_url("http://example.com/a", 0)]).unwrap();
        let record = frontier.check_out().unwrap().unwrap();

        frontier
            .check_in(
                &record.url_key,
                Status::Done,
                &CheckIn {
                    increment_try_count: true,
                    status_code: Some(200),
                    filename: Some("example.com/a".to_string()),
                    error: None,
                },
            )
            .unwrap();

        let updated = frontier.get(&record.url_key).unwrap().unwrap();
        assert_eq!(updated.status, Status::Done);
        assert_eq!(updated.try_count, 1);
        assert_eq!(updated.status_code, Some(200));
        assert!(updated.completed_at.is_some());
    }

    #[test]
    fn test_release_in_progress() {
        let dir = tempdir().unwrap();
        let frontier = Frontier::open(&dir.path().join("crawl.db")).unwrap();

        frontier.add_many(&[new_url("http://example.com/a", 0)]).unwrap();
        frontier.check_out().unwrap().unwrap();

        assert_eq!(frontier.release_in_progress().unwrap(), 1);
        let counts = frontier.count_by_status().unwrap();
        assert_eq!(counts.todo, 1);
        assert_eq!(counts.in_progress, 0);
    }

    #[test]
    fn test_resume_reuses_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crawl.db");

        {
            let frontier = Frontier::open(&path).unwrap();
            frontier.add_many(&[new_url("http://example.com/a", 0)]).unwrap();
        }

        let frontier = Frontier::open(&path).unwrap();
        assert_eq!(frontier.count_by_status().unwrap().todo, 1);
    }

    #[test]
    fn test_hostnames_and_report() {
        let dir = tempdir().unwrap();
        let frontier = Frontier::open(&dir.path().join("crawl.db")).unwrap();

        frontier
            .add_many(&[
                new_url("http://b.example/x", 0),
                new_url("http://a.example/y", 1),
                new_url("http://a.example/z", 1),
            ])
            .unwrap();

        assert_eq!(
            frontier.hostnames().unwrap(),
            vec!["a.example".to_string(), "b.example".to_string()]
        );

        let report = frontier.status_report().unwrap();
        assert_eq!(report["todo"], 3);
        assert_eq!(report["done"], 0);
    }

    #[test]
    fn test_visits_round_trip() {
        let dir = tempdir().unwrap();
        let frontier = Frontier::open(&dir.path().join("crawl.db")).unwrap();

        frontier
            .add_visit("http://example.com/a", "AAAA", "<urn:uuid:1>")
            .unwrap();

        assert_eq!(
            frontier
                .get_revisit_id("http://example.com/a", "AAAA")
                .unwrap()
                .as_deref(),
            Some("<urn:uuid:1>")
        );
        assert!(frontier
            .get_revisit_id("http://example.com/a", "BBBB")
            .unwrap()
            .is_none());
    }
}
