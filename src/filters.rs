//! URL acceptance policy.
//!
//! A [`FilterChain`] evaluates every filter and reports which ones failed, so
//! rejections can be logged by name and hooks can inspect the verdict. A URL
//! is accepted only when every filter passes. Robots exclusion is not part of
//! the chain; it needs network I/O and is enforced by the engine.

use regex::Regex;

use crate::models::UrlRecord;
use crate::urlnorm::{is_subdir, schemes_similar, UrlInfo};

/// A single accept/reject predicate.
pub trait UrlFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the URL passes this filter.
    fn test(&self, url: &UrlInfo, record: &UrlRecord) -> bool;
}

/// Outcome of running the whole chain.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub verdict: bool,
    /// Names of the filters that rejected the URL.
    pub failed: Vec<&'static str>,
}

/// Ordered set of filters with a demultiplexed result.
pub struct FilterChain {
    filters: Vec<Box<dyn UrlFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn UrlFilter>>) -> Self {
        Self { filters }
    }

    pub fn test(&self, url: &UrlInfo, record: &UrlRecord) -> FilterVerdict {
        let failed: Vec<&'static str> = self
            .filters
            .iter()
            .filter(|f| !f.test(url, record))
            .map(|f| f.name())
            .collect();

        FilterVerdict {
            verdict: failed.is_empty(),
            failed,
        }
    }

    /// Re-test ignoring the host-scoped filters.
    ///
    /// Redirect targets are followed even when span-host rules would reject
    /// them, so a requested resource is not lost behind a hostname move.
    pub fn test_for_redirect(&self, url: &UrlInfo, record: &UrlRecord) -> FilterVerdict {
        const HOST_FILTERS: &[&str] = &["span_hosts", "domains", "hostnames"];

        let failed: Vec<&'static str> = self
            .filters
            .iter()
            .filter(|f| !HOST_FILTERS.contains(&f.name()))
            .filter(|f| !f.test(url, record))
            .map(|f| f.name())
            .collect();

        FilterVerdict {
            verdict: failed.is_empty(),
            failed,
        }
    }
}

/// Allow listed schemes only.
pub struct SchemeFilter {
    allowed: Vec<String>,
}

impl SchemeFilter {
    pub fn new(allowed: &[&str]) -> Self {
        Self {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for SchemeFilter {
    fn default() -> Self {
        Self::new(&["http", "https"])
    }
}

impl UrlFilter for SchemeFilter {
    fn name(&self) -> &'static str {
        "scheme"
    }

    fn test(&self, url: &UrlInfo, _record: &UrlRecord) -> bool {
        self.allowed.iter().any(|s| s == url.scheme())
    }
}

/// Reject all non-seed URLs unless recursion (or requisite fetching) is on.
pub struct RecursiveFilter {
    enabled: bool,
    page_requisites: bool,
}

impl RecursiveFilter {
    pub fn new(enabled: bool, page_requisites: bool) -> Self {
        Self {
            enabled,
            page_requisites,
        }
    }
}

impl UrlFilter for RecursiveFilter {
    fn name(&self) -> &'static str {
        "recursive"
    }

    fn test(&self, _url: &UrlInfo, record: &UrlRecord) -> bool {
        if record.level == 0 {
            return true;
        }
        if record.is_inline() {
            self.page_requisites
        } else {
            self.enabled
        }
    }
}

/// Depth budget, with a separate budget for page requisites.
pub struct LevelFilter {
    max_depth: u32,
    requisite_max_depth: u32,
}

impl LevelFilter {
    pub fn new(max_depth: u32, requisite_max_depth: u32) -> Self {
        Self {
            max_depth,
            requisite_max_depth,
        }
    }
}

impl UrlFilter for LevelFilter {
    fn name(&self) -> &'static str {
        "level"
    }

    fn test(&self, _url: &UrlInfo, record: &UrlRecord) -> bool {
        if self.requisite_max_depth > 0
            && record.inline_level > self.requisite_max_depth
        {
            return false;
        }

        if self.max_depth == 0 {
            return true;
        }
        if record.is_inline() {
            // Requisites may overshoot the depth limit slightly so that
            // pages at the boundary still render (frames, stylesheets).
            record.level <= self.max_depth + 2
        } else {
            record.level <= self.max_depth
        }
    }
}

/// Stop retrying once the try budget is spent.
pub struct TriesFilter {
    max_tries: u32,
}

impl TriesFilter {
    pub fn new(max_tries: u32) -> Self {
        Self { max_tries }
    }
}

impl UrlFilter for TriesFilter {
    fn name(&self) -> &'static str {
        "tries"
    }

    fn test(&self, _url: &UrlInfo, record: &UrlRecord) -> bool {
        self.max_tries == 0 || record.try_count < self.max_tries
    }
}

/// Which families of off-host links may be followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanHostsAllow {
    PageRequisites,
    LinkedPages,
}

/// Keep the crawl on the seed hosts unless spanning is permitted.
pub struct SpanHostsFilter {
    enabled: bool,
    page_requisites: bool,
    linked_pages: bool,
    seed_hosts: Vec<String>,
}

impl SpanHostsFilter {
    pub fn new(seeds: &[UrlInfo], enabled: bool, allow: &[SpanHostsAllow]) -> Self {
        Self {
            enabled,
            page_requisites: allow.contains(&SpanHostsAllow::PageRequisites),
            linked_pages: allow.contains(&SpanHostsAllow::LinkedPages),
            seed_hosts: seeds.iter().map(|u| u.host().to_string()).collect(),
        }
    }

    fn is_seed_host(&self, host: &str) -> bool {
        self.seed_hosts.iter().any(|h| h == host)
    }
}

impl UrlFilter for SpanHostsFilter {
    fn name(&self) -> &'static str {
        "span_hosts"
    }

    fn test(&self, url: &UrlInfo, record: &UrlRecord) -> bool {
        if self.enabled {
            return true;
        }
        if self.is_seed_host(url.host()) {
            return true;
        }
        // Direct requisites only: a spanned host does not grow its own
        // requisite subtree.
        if self.page_requisites && record.inline_level == 1 {
            return true;
        }
        if self.linked_pages {
            if let Some(referer) = &record.referer {
                if let Ok(referer) = UrlInfo::parse(referer) {
                    if self.is_seed_host(referer.host()) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Hostname suffix include/exclude lists (`--domains`, `--exclude-domains`).
pub struct DomainsFilter {
    accepted: Vec<String>,
    rejected: Vec<String>,
}

impl DomainsFilter {
    pub fn new(accepted: Vec<String>, rejected: Vec<String>) -> Self {
        Self { accepted, rejected }
    }

    fn matches(list: &[String], host: &str) -> bool {
        list.iter().any(|domain| {
            let domain = domain.trim_start_matches('.');
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }
}

impl UrlFilter for DomainsFilter {
    fn name(&self) -> &'static str {
        "domains"
    }

    fn test(&self, url: &UrlInfo, _record: &UrlRecord) -> bool {
        let host = url.host();
        if !self.accepted.is_empty() && !Self::matches(&self.accepted, host) {
            return false;
        }
        if !self.rejected.is_empty() && Self::matches(&self.rejected, host) {
            return false;
        }
        true
    }
}

/// Exact hostname include/exclude lists.
pub struct HostnamesFilter {
    accepted: Vec<String>,
    rejected: Vec<String>,
}

impl HostnamesFilter {
    pub fn new(accepted: Vec<String>, rejected: Vec<String>) -> Self {
        Self { accepted, rejected }
    }
}

impl UrlFilter for HostnamesFilter {
    fn name(&self) -> &'static str {
        "hostnames"
    }

    fn test(&self, url: &UrlInfo, _record: &UrlRecord) -> bool {
        let host = url.host();
        if !self.accepted.is_empty() && !self.accepted.iter().any(|h| h == host) {
            return false;
        }
        if self.rejected.iter().any(|h| h == host) {
            return false;
        }
        true
    }
}

/// `--accept-regex` / `--reject-regex` on the full URL.
pub struct RegexFilter {
    accepted: Option<Regex>,
    rejected: Option<Regex>,
}

impl RegexFilter {
    pub fn new(accepted: Option<Regex>, rejected: Option<Regex>) -> Self {
        Self { accepted, rejected }
    }
}

impl UrlFilter for RegexFilter {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn test(&self, url: &UrlInfo, _record: &UrlRecord) -> bool {
        if let Some(accepted) = &self.accepted {
            if !accepted.is_match(url.fetch_url()) {
                return false;
            }
        }
        if let Some(rejected) = &self.rejected {
            if rejected.is_match(url.fetch_url()) {
                return false;
            }
        }
        true
    }
}

/// Path-prefix include/exclude lists (`--include-directories` and friends).
pub struct DirectoriesFilter {
    accepted: Vec<String>,
    rejected: Vec<String>,
}

impl DirectoriesFilter {
    pub fn new(accepted: Vec<String>, rejected: Vec<String>) -> Self {
        Self { accepted, rejected }
    }
}

impl UrlFilter for DirectoriesFilter {
    fn name(&self) -> &'static str {
        "directories"
    }

    fn test(&self, url: &UrlInfo, _record: &UrlRecord) -> bool {
        let path = url.path();
        if !self.accepted.is_empty()
            && !self
                .accepted
                .iter()
                .any(|dir| is_subdir(dir, path, false, true))
        {
            return false;
        }
        if self
            .rejected
            .iter()
            .any(|dir| is_subdir(dir, path, false, true))
        {
            return false;
        }
        true
    }
}

/// `--no-parent`: only descend below the seed's directory.
pub struct ParentFilter;

impl UrlFilter for ParentFilter {
    fn name(&self) -> &'static str {
        "parent"
    }

    fn test(&self, url: &UrlInfo, record: &UrlRecord) -> bool {
        if record.is_inline() {
            return true;
        }

        let root = match UrlInfo::parse(&record.root_url) {
            Ok(root) => root,
            Err(_) => return true,
        };

        if schemes_similar(url.scheme(), root.scheme())
            && url.host() == root.host()
            && (url.scheme() != root.scheme() || url.port() == root.port())
        {
            return is_subdir(root.path(), url.path(), true, false);
        }

        true
    }
}

/// `--https-only`.
pub struct HttpsOnlyFilter;

impl UrlFilter for HttpsOnlyFilter {
    fn name(&self) -> &'static str {
        "https_only"
    }

    fn test(&self, url: &UrlInfo, _record: &UrlRecord) -> bool {
        url.scheme() == "https"
    }
}

/// `--accept` / `--reject` filename suffix globs.
pub struct FilenameSuffixFilter {
    accepted: Vec<String>,
    rejected: Vec<String>,
}

impl FilenameSuffixFilter {
    pub fn new(accepted: Vec<String>, rejected: Vec<String>) -> Self {
        Self { accepted, rejected }
    }

    fn matches(list: &[String], filename: &str) -> bool {
        list.iter().any(|pattern| {
            if pattern.contains('*') || pattern.contains('?') {
                glob_match(pattern, filename)
            } else {
                filename.ends_with(pattern.as_str())
            }
        })
    }
}

impl UrlFilter for FilenameSuffixFilter {
    fn name(&self) -> &'static str {
        "filename_suffix"
    }

    fn test(&self, url: &UrlInfo, _record: &UrlRecord) -> bool {
        let filename = url.path().rsplit('/').next().unwrap_or("");
        if filename.is_empty() {
            return true;
        }

        if !self.accepted.is_empty() {
            if !self.rejected.is_empty() {
                return Self::matches(&self.accepted, filename)
                    && !Self::matches(&self.rejected, filename);
            }
            return Self::matches(&self.accepted, filename);
        }
        if Self::matches(&self.rejected, filename) {
            return false;
        }
        true
    }
}

/// Translate a shell glob into an anchored regex match.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map(|re| re.is_match(text)).unwrap_or(false)
}

/// Aggregate byte cap (`--quota`). Seeds are always allowed through so a
/// directly-requested resource is never dropped by its own quota.
pub struct QuotaFilter {
    stats: std::sync::Arc<crate::stats::Statistics>,
    quota: u64,
}

impl QuotaFilter {
    pub fn new(stats: std::sync::Arc<crate::stats::Statistics>, quota: u64) -> Self {
        Self { stats, quota }
    }
}

impl UrlFilter for QuotaFilter {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn test(&self, _url: &UrlInfo, record: &UrlRecord) -> bool {
        if record.level == 0 {
            return true;
        }
        self.quota == 0 || self.stats.bytes_downloaded() < self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewUrl, Status, UrlRecord};
    use chrono::Utc;

    fn record(url: &str, level: u32, inline_level: u32) -> UrlRecord {
        let info = UrlInfo::parse(url).unwrap();
        let new = NewUrl::seed(&info);
        UrlRecord {
            id: 1,
            url: new.url,
            url_key: new.url_key,
            parent_url: None,
            root_url: format!("http://{}/", info.host()),
            status: Status::Todo,
            try_count: 0,
            level,
            inline_level,
            link_type: None,
            post_data: None,
            referer: None,
            status_code: None,
            filename: None,
            last_error: None,
            discovered_at: Utc::now(),
            completed_at: None,
        }
    }

    fn info(url: &str) -> UrlInfo {
        UrlInfo::parse(url).unwrap()
    }

    #[test]
    fn test_recursive_filter() {
        let filter = RecursiveFilter::new(false, false);
        assert!(filter.test(&info("http://h/"), &record("http://h/", 0, 0)));
        assert!(!filter.test(&info("http://h/a"), &record("http://h/a", 1, 0)));

        let filter = RecursiveFilter::new(false, true);
        assert!(filter.test(&info("http://h/i.png"), &record("http://h/i.png", 1, 1)));
    }

    #[test]
    fn test_level_filter_with_requisite_overshoot() {
        let filter = LevelFilter::new(2, 5);
        assert!(filter.test(&info("http://h/"), &record("http://h/", 2, 0)));
        assert!(!filter.test(&info("http://h/"), &record("http://h/", 3, 0)));
        // Requisites may exceed the page depth by up to two levels.
        assert!(filter.test(&info("http://h/i.png"), &record("http://h/i.png", 4, 1)));
        assert!(!filter.test(&info("http://h/i.png"), &record("http://h/i.png", 5, 1)));
        // But not the requisite depth budget.
        assert!(!filter.test(&info("http://h/i.png"), &record("http://h/i.png", 1, 6)));
    }

    #[test]
    fn test_span_hosts_filter() {
        let seeds = vec![info("http://h/")];
        let filter = SpanHostsFilter::new(&seeds, false, &[]);
        assert!(filter.test(&info("http://h/a"), &record("http://h/a", 1, 0)));
        assert!(!filter.test(&info("http://other/a"), &record("http://other/a", 1, 0)));

        let filter =
            SpanHostsFilter::new(&seeds, false, &[SpanHostsAllow::PageRequisites]);
        assert!(filter.test(&info("http://cdn/i.png"), &record("http://cdn/i.png", 1, 1)));
        // Requisites of requisites stay off the spanned host.
        assert!(!filter.test(&info("http://cdn/f.woff"), &record("http://cdn/f.woff", 2, 2)));
    }

    #[test]
    fn test_domains_filter() {
        let filter = DomainsFilter::new(vec!["example.com".to_string()], vec![]);
        assert!(filter.test(&info("http://example.com/"), &record("http://example.com/", 1, 0)));
        assert!(filter.test(
            &info("http://sub.example.com/"),
            &record("http://sub.example.com/", 1, 0)
        ));
        assert!(!filter.test(&info("http://example.org/"), &record("http://example.org/", 1, 0)));

        let filter = DomainsFilter::new(vec![], vec!["ads.example.com".to_string()]);
        assert!(!filter.test(
            &info("http://ads.example.com/x"),
            &record("http://ads.example.com/x", 1, 0)
        ));
    }

    #[test]
    fn test_parent_filter() {
        let filter = ParentFilter;
        let mut rec = record("http://h/docs/page", 1, 0);
        rec.root_url = "http://h/docs/".to_string();
        assert!(filter.test(&info("http://h/docs/page"), &rec));
        assert!(!filter.test(&info("http://h/other/"), &rec));
        // Requisites are exempt.
        rec.inline_level = 1;
        assert!(filter.test(&info("http://h/other/i.png"), &rec));
    }

    #[test]
    fn test_filename_suffix_filter() {
        let filter = FilenameSuffixFilter::new(vec![".pdf".to_string()], vec![]);
        assert!(filter.test(&info("http://h/a.pdf"), &record("http://h/a.pdf", 1, 0)));
        assert!(!filter.test(&info("http://h/a.html"), &record("http://h/a.html", 1, 0)));
        // Directory URLs (no filename) always pass.
        assert!(filter.test(&info("http://h/dir/"), &record("http://h/dir/", 1, 0)));

        let filter = FilenameSuffixFilter::new(vec!["*.jp?g".to_string()], vec![]);
        assert!(filter.test(&info("http://h/a.jpeg"), &record("http://h/a.jpeg", 1, 0)));
    }

    #[test]
    fn test_chain_reports_failures() {
        let chain = FilterChain::new(vec![
            Box::new(SchemeFilter::default()),
            Box::new(HttpsOnlyFilter),
        ]);
        let verdict = chain.test(&info("http://h/a"), &record("http://h/a", 1, 0));
        assert!(!verdict.verdict);
        assert_eq!(verdict.failed, vec!["https_only"]);
    }

    #[test]
    fn test_redirect_bypasses_host_filters() {
        let seeds = vec![info("http://h/")];
        let chain = FilterChain::new(vec![
            Box::new(SchemeFilter::default()),
            Box::new(SpanHostsFilter::new(&seeds, false, &[])),
        ]);
        let rec = record("http://other/a", 1, 0);
        assert!(!chain.test(&info("http://other/a"), &rec).verdict);
        assert!(chain.test_for_redirect(&info("http://other/a"), &rec).verdict);
    }

    #[test]
    fn test_adding_reject_filter_never_grows_accepted_set() {
        let urls = [
            "http://h/a.html",
            "http://h/b.pdf",
            "http://other/c.html",
        ];
        let base = FilterChain::new(vec![Box::new(SchemeFilter::default())]);
        let stricter = FilterChain::new(vec![
            Box::new(SchemeFilter::default()),
            Box::new(FilenameSuffixFilter::new(vec![], vec![".pdf".to_string()])),
        ]);

        for url in urls {
            let rec = record(url, 1, 0);
            let before = base.test(&info(url), &rec).verdict;
            let after = stricter.test(&info(url), &rec).verdict;
            // Monotonicity: stricter chain accepts a subset.
            assert!(!after || before);
        }
    }
}
