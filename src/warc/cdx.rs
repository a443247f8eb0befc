//! CDX index files: one line per WARC `response` record.
//!
//! Eleven space-separated columns, announced by the header line
//! ` CDX N b a m s k r M S V g`:
//! massaged URL, 14-digit timestamp, original URL, MIME type, status code,
//! payload digest, redirect, meta tags, record size, record offset, WARC
//! filename. Fields with no value carry `-`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Metadata for one CDX line, supplied by the recorder.
#[derive(Debug, Clone)]
pub struct CdxMeta {
    pub url: String,
    pub mime_type: Option<String>,
    pub status_code: Option<u16>,
    pub payload_digest: Option<String>,
    pub redirect_target: Option<String>,
}

pub struct CdxWriter {
    path: PathBuf,
}

impl CdxWriter {
    /// Open the index, writing the header when the file is new.
    pub fn open(path: &Path, appending: bool) -> io::Result<Self> {
        let exists = path.exists();
        if !appending || !exists {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            writeln!(file, " CDX N b a m s k r M S V g")?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line for a response record.
    pub fn write_entry(
        &self,
        meta: &CdxMeta,
        record_size: u64,
        record_offset: u64,
        warc_filename: &str,
    ) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;

        let digest = meta
            .payload_digest
            .as_deref()
            .map(|d| d.trim_start_matches("sha1:").to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| "-".to_string());

        writeln!(
            file,
            "{} {} {} {} {} {} {} {} {} {} {}",
            massage_url(&meta.url),
            Utc::now().format("%Y%m%d%H%M%S"),
            dash_if_empty(&meta.url),
            meta.mime_type.as_deref().unwrap_or("-"),
            meta.status_code
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            digest,
            meta.redirect_target.as_deref().unwrap_or("-"),
            "-",
            record_size,
            record_offset,
            warc_filename,
        )
    }
}

/// Canonical searchable form of a URL: scheme and `www.` prefix dropped,
/// host lowercased.
fn massage_url(url: &str) -> String {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    let (host, rest) = match stripped.find('/') {
        Some(idx) => stripped.split_at(idx),
        None => (stripped, "/"),
    };

    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    format!("{host}{rest}")
}

fn dash_if_empty(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crawl.cdx");

        CdxWriter::open(&path, false).unwrap();
        let writer = CdxWriter::open(&path, true).unwrap();
        writer
            .write_entry(
                &CdxMeta {
                    url: "http://example.com/a".to_string(),
                    mime_type: Some("text/html".to_string()),
                    status_code: Some(200),
                    payload_digest: Some("sha1:ABCDEF".to_string()),
                    redirect_target: None,
                },
                1234,
                0,
                "crawl.warc.gz",
            )
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], " CDX N b a m s k r M S V g");

        let fields: Vec<&str> = lines[1].split(' ').collect();
        assert_eq!(fields.len(), 11);
        assert_eq!(fields[0], "example.com/a");
        assert_eq!(fields[2], "http://example.com/a");
        assert_eq!(fields[3], "text/html");
        assert_eq!(fields[4], "200");
        assert_eq!(fields[5], "ABCDEF");
        assert_eq!(fields[8], "1234");
        assert_eq!(fields[9], "0");
        assert_eq!(fields[10], "crawl.warc.gz");
    }

    #[test]
    fn test_massage_url() {
        assert_eq!(massage_url("http://WWW.Example.com/A/b"), "example.com/A/b");
        assert_eq!(massage_url("https://example.com"), "example.com/");
    }
}
