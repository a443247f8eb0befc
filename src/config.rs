//! Typed crawl configuration assembled from command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::fetch::{ClientOptions, FetcherOptions};
use crate::warc::WarcOptions;
use crate::writer::WriterOptions;

/// Everything the crawl needs, grouped by consumer.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub engine: EngineOptions,
    pub client: ClientOptions,
    pub fetcher: FetcherOptions,
    pub writer: WriterOptions,
    pub warc: Option<WarcOptions>,
    pub cookies_enabled: bool,
    pub load_cookies: Option<PathBuf>,
    pub save_cookies: Option<PathBuf>,
    pub keep_session_cookies: bool,
}

/// Parse a byte size with optional `k`/`m`/`g` suffix (binary multiples).
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty size".to_string());
    }

    let (digits, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1024u64),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    let number: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size {value:?}"))?;
    if number < 0.0 {
        return Err(format!("negative size {value:?}"));
    }
    Ok((number * multiplier as f64) as u64)
}

/// Parse seconds, fractions allowed.
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    if seconds < 0.0 {
        return Err(format!("negative duration {value:?}"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Split a `Name: Value` header argument.
pub fn parse_header(value: &str) -> Result<(String, String), String> {
    let (name, rest) = value
        .split_once(':')
        .ok_or_else(|| format!("header {value:?} missing colon"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header {value:?} has empty name"));
    }
    Ok((name.to_string(), rest.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("1.5m").unwrap(), 1_572_864);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("-5").is_err());
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_seconds("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_seconds("never").is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Crawl: test run").unwrap(),
            ("X-Crawl".to_string(), "test run".to_string())
        );
        assert!(parse_header("no colon here").is_err());
    }
}
