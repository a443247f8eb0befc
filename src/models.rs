//! Frontier data model: URL records and their lifecycle.

use chrono::{DateTime, Utc};

/// Lifecycle of a frontier URL.
///
/// Transitions are monotonic: `Todo` → `InProgress` → `Done`/`Error`.
/// `Skipped` marks filter rejections. A retryable failure moves the record
/// back to `Todo` with an incremented try count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Todo,
    InProgress,
    Done,
    Error,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::InProgress => "in_progress",
            Status::Done => "done",
            Status::Error => "error",
            Status::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Status::Todo),
            "in_progress" => Some(Status::InProgress),
            "done" => Some(Status::Done),
            "error" => Some(Status::Error),
            "skipped" => Some(Status::Skipped),
            _ => None,
        }
    }
}

/// Expected content class of a link, used to pick an extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Html,
    Css,
    JavaScript,
    Sitemap,
    Robots,
    Media,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Html => "html",
            LinkType::Css => "css",
            LinkType::JavaScript => "js",
            LinkType::Sitemap => "sitemap",
            LinkType::Robots => "robots",
            LinkType::Media => "media",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "html" => Some(LinkType::Html),
            "css" => Some(LinkType::Css),
            "js" => Some(LinkType::JavaScript),
            "sitemap" => Some(LinkType::Sitemap),
            "robots" => Some(LinkType::Robots),
            "media" => Some(LinkType::Media),
            _ => None,
        }
    }
}

/// A row of the frontier `urls` table.
#[derive(Debug, Clone)]
pub struct UrlRecord {
    pub id: i64,
    /// Canonical URL string.
    pub url: String,
    /// SHA-256 of the canonical URL; unique across the table.
    pub url_key: String,
    /// URL of the document that linked here.
    pub parent_url: Option<String>,
    /// Seed URL that introduced this branch of the crawl.
    pub root_url: String,
    pub status: Status,
    pub try_count: u32,
    /// Recursion depth from the nearest seed (seeds are level 0).
    pub level: u32,
    /// 0 for navigational links; N > 0 for page requisites, counting
    /// requisite nesting (an image referenced by a stylesheet is 2).
    pub inline_level: u32,
    pub link_type: Option<LinkType>,
    /// When set, fetch as POST with this body.
    pub post_data: Option<String>,
    pub referer: Option<String>,
    pub status_code: Option<u16>,
    pub filename: Option<String>,
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UrlRecord {
    pub fn is_inline(&self) -> bool {
        self.inline_level > 0
    }
}

/// A URL being inserted into the frontier.
#[derive(Debug, Clone)]
pub struct NewUrl {
    pub url: String,
    pub url_key: String,
    pub parent_url: Option<String>,
    pub root_url: String,
    pub level: u32,
    pub inline_level: u32,
    pub link_type: Option<LinkType>,
    pub post_data: Option<String>,
    pub referer: Option<String>,
}

impl NewUrl {
    /// A seed supplied on the command line.
    pub fn seed(url: &crate::urlnorm::UrlInfo) -> Self {
        Self {
            url: url.fetch_url().to_string(),
            url_key: url.key().to_string(),
            parent_url: None,
            root_url: url.fetch_url().to_string(),
            level: 0,
            inline_level: 0,
            link_type: None,
            post_data: None,
            referer: None,
        }
    }
}

/// Fields written back when a URL leaves `InProgress`.
#[derive(Debug, Clone, Default)]
pub struct CheckIn {
    pub increment_try_count: bool,
    pub status_code: Option<u16>,
    pub filename: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            Status::Todo,
            Status::InProgress,
            Status::Done,
            Status::Error,
            Status::Skipped,
        ] {
            assert_eq!(Status::from_str(status.as_str()), Some(status));
        }
        assert_eq!(Status::from_str("bogus"), None);
    }

    #[test]
    fn test_link_type_round_trip() {
        for lt in [
            LinkType::Html,
            LinkType::Css,
            LinkType::JavaScript,
            LinkType::Sitemap,
            LinkType::Robots,
            LinkType::Media,
        ] {
            assert_eq!(LinkType::from_str(lt.as_str()), Some(lt));
        }
    }
}
