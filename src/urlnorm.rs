//! URL parsing and canonicalization.
//!
//! Every URL entering the system is normalized into a [`UrlInfo`]: scheme and
//! host lowercased (IDN hosts converted to A-labels), default ports dropped,
//! dot-segments resolved, runs of `/` collapsed, non-ASCII path bytes
//! percent-encoded as UTF-8. The canonical string is what goes on the wire;
//! its SHA-256 is the frontier dedup key.

use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Characters percent-encoded inside a path segment beyond the control set.
const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid URL {0:?}: {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("URL {0:?} has no host")]
    NoHost(String),
}

/// A parsed, canonicalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlInfo {
    url: Url,
    canonical: String,
    key: String,
}

impl UrlInfo {
    /// Parse and canonicalize a URL string.
    pub fn parse(input: &str) -> Result<Self, NormalizeError> {
        let url = Url::parse(input.trim())
            .map_err(|e| NormalizeError::InvalidUrl(input.to_string(), e))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(NormalizeError::UnsupportedScheme(other.to_string())),
        }

        if url.host_str().is_none() {
            return Err(NormalizeError::NoHost(input.to_string()));
        }

        let canonical = canonicalize(&url);
        // Re-parse so accessors observe the canonical form.
        let url = Url::parse(&canonical)
            .map_err(|e| NormalizeError::InvalidUrl(canonical.clone(), e))?;

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let key = hex::encode(hasher.finalize());

        Ok(Self { url, canonical, key })
    }

    /// Resolve a possibly-relative reference against this URL.
    pub fn join(&self, reference: &str) -> Result<Self, NormalizeError> {
        let joined = self
            .url
            .join(reference.trim())
            .map_err(|e| NormalizeError::InvalidUrl(reference.to_string(), e))?;
        Self::parse(joined.as_str())
    }

    /// The canonical URL as sent on the wire (fragment stripped).
    pub fn fetch_url(&self) -> &str {
        &self.canonical
    }

    /// The frontier dedup key: SHA-256 of the canonical form.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Lowercased host; IPv6 addresses are bracketed.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// Explicit port, or the scheme default.
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// `(scheme, host, port)` triple identifying the origin.
    pub fn origin_key(&self) -> (String, String, u16) {
        (
            self.scheme().to_string(),
            self.host().to_string(),
            self.port(),
        )
    }

    /// The origin with the path replaced, e.g. for `/robots.txt`.
    pub fn with_path(&self, path: &str) -> Result<Self, NormalizeError> {
        let mut url = self.url.clone();
        url.set_path(path);
        url.set_query(None);
        Self::parse(url.as_str())
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    /// Host header value: host, plus the port when it is not the default.
    pub fn host_header(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => self.host().to_string(),
        }
    }
}

impl fmt::Display for UrlInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Produce the canonical string form of a parsed URL.
fn canonicalize(url: &Url) -> String {
    let mut out = String::with_capacity(url.as_str().len());

    out.push_str(url.scheme());
    out.push_str("://");

    if !url.username().is_empty() {
        out.push_str(url.username());
        if let Some(password) = url.password() {
            out.push(':');
            out.push_str(password);
        }
        out.push('@');
    }

    // The url crate already lowercases and punycodes the host.
    out.push_str(url.host_str().unwrap_or(""));

    if let Some(port) = url.port() {
        // Url::port() is None when the port equals the scheme default.
        out.push(':');
        out.push_str(&port.to_string());
    }

    out.push_str(&normalize_path(url.path()));

    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }

    // Fragment intentionally dropped: it never reaches the wire and must not
    // split the dedup key.
    out
}

/// Collapse `//` runs and re-encode each segment.
fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let mut out = String::with_capacity(path.len());

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(&utf8_percent_encode(segment, PATH_SEGMENT).to_string());
    }

    if out.is_empty() {
        out.push('/');
    } else if trailing_slash {
        out.push('/');
    }

    out
}

/// Whether two schemes are close enough for the parent filter (http ≍ https).
pub fn schemes_similar(a: &str, b: &str) -> bool {
    a == b || matches!((a, b), ("http", "https") | ("https", "http"))
}

/// Whether `path` is underneath directory `base`.
///
/// `wildcards` enables `*` globbing in `base`. `trailing_slash` treats a base
/// without one as the containing directory of its final segment.
pub fn is_subdir(base: &str, path: &str, trailing_slash: bool, wildcards: bool) -> bool {
    let base = if trailing_slash && !base.ends_with('/') {
        match base.rfind('/') {
            Some(idx) => &base[..=idx],
            None => "/",
        }
    } else {
        base
    };

    if wildcards && base.contains('*') {
        let pattern = format!(
            "^{}",
            regex::escape(base).replace("\\*", ".*")
        );
        return regex::Regex::new(&pattern)
            .map(|re| re.is_match(path))
            .unwrap_or(false);
    }

    path.starts_with(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases_scheme_and_host() {
        let info = UrlInfo::parse("HTTP://ExAmPlE.Com/Path").unwrap();
        assert_eq!(info.fetch_url(), "http://example.com/Path");
    }

    #[test]
    fn test_strips_default_port() {
        let info = UrlInfo::parse("http://example.com:80/").unwrap();
        assert_eq!(info.fetch_url(), "http://example.com/");
        assert_eq!(info.port(), 80);

        let info = UrlInfo::parse("https://example.com:8443/").unwrap();
        assert_eq!(info.fetch_url(), "https://example.com:8443/");
        assert_eq!(info.port(), 8443);
    }

    #[test]
    fn test_strips_fragment() {
        let a = UrlInfo::parse("http://example.com/page#top").unwrap();
        let b = UrlInfo::parse("http://example.com/page").unwrap();
        assert_eq!(a.fetch_url(), b.fetch_url());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_resolves_dot_segments() {
        let info = UrlInfo::parse("http://example.com/a/b/../c/./d").unwrap();
        assert_eq!(info.path(), "/a/c/d");
    }

    #[test]
    fn test_collapses_slash_runs() {
        let info = UrlInfo::parse("http://example.com//a///b").unwrap();
        assert_eq!(info.path(), "/a/b");
    }

    #[test]
    fn test_idn_to_punycode() {
        let info = UrlInfo::parse("http://bücher.example/").unwrap();
        assert_eq!(info.host(), "xn--bcher-kva.example");
    }

    #[test]
    fn test_percent_encodes_unicode_path() {
        let info = UrlInfo::parse("http://example.com/traîneau").unwrap();
        assert_eq!(info.path(), "/tra%C3%AEneau");
    }

    #[test]
    fn test_query_order_preserved() {
        let info = UrlInfo::parse("http://example.com/?b=2&a=1").unwrap();
        assert_eq!(info.query(), Some("b=2&a=1"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(UrlInfo::parse("not a url").is_err());
        assert!(UrlInfo::parse("mailto:user@example.com").is_err());
    }

    #[test]
    fn test_key_is_stable() {
        let a = UrlInfo::parse("http://EXAMPLE.com:80/x").unwrap();
        let b = UrlInfo::parse("http://example.com/x").unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_join_relative() {
        let base = UrlInfo::parse("http://example.com/dir/page.html").unwrap();
        let child = base.join("../img.png").unwrap();
        assert_eq!(child.fetch_url(), "http://example.com/img.png");
    }

    #[test]
    fn test_is_subdir() {
        assert!(is_subdir("/a/", "/a/b", false, false));
        assert!(!is_subdir("/a/", "/b/c", false, false));
        assert!(is_subdir("/a/index.html", "/a/b", true, false));
        assert!(is_subdir("/*/c/", "/a/c/d", false, true));
    }

    #[test]
    fn test_schemes_similar() {
        assert!(schemes_similar("http", "https"));
        assert!(schemes_similar("https", "https"));
    }
}
