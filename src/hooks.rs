//! Extension points around the crawl pipeline.
//!
//! Plugins implement [`CrawlHooks`]; every method has a no-op default so a
//! plugin only overrides what it needs. Hooks are registered on the engine at
//! startup and cleared at shutdown. A panicking hook is caught and reported
//! as an error without killing the engine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::warn;

use crate::models::UrlRecord;
use crate::stats::Statistics;
use crate::urlnorm::UrlInfo;

/// What the engine should do with the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    /// Proceed normally.
    #[default]
    Normal,
    /// Requeue the item regardless of outcome.
    Retry,
    /// Mark the item finished regardless of outcome.
    Finish,
    /// Stop the whole crawl gracefully.
    Stop,
}

/// A child URL contributed by a hook.
#[derive(Debug, Clone)]
pub struct HookUrl {
    pub url: String,
    pub inline: bool,
    pub post_data: Option<String>,
}

/// Summary of a completed response handed to hooks.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: u16,
    pub body_len: u64,
    pub filename: Option<String>,
}

/// Callbacks invoked at fixed points of the pipeline.
///
/// Receivers get records by reference and communicate through return values;
/// they cannot mutate engine state directly.
pub trait CrawlHooks: Send + Sync {
    /// Veto a URL after the filter chain accepted it.
    fn accept_url(&self, _url: &UrlInfo, _record: &UrlRecord, _verdict: bool) -> bool {
        _verdict
    }

    /// Response headers are available; body not yet consumed.
    fn handle_pre_response(&self, _record: &UrlRecord, _status: u16) -> HookAction {
        HookAction::Normal
    }

    /// Body complete and written.
    fn handle_response(&self, _record: &UrlRecord, _response: &ResponseInfo) -> HookAction {
        HookAction::Normal
    }

    /// A fetch failed with an error.
    fn handle_error(&self, _record: &UrlRecord, _error: &str) -> HookAction {
        HookAction::Normal
    }

    /// Contribute extra child URLs after link extraction.
    fn get_urls(&self, _record: &UrlRecord, _filename: Option<&str>) -> Vec<HookUrl> {
        Vec::new()
    }

    /// Adjust the politeness delay before the next request.
    fn wait_time(&self, seconds: f64, _record: &UrlRecord) -> f64 {
        seconds
    }

    /// A URL entered the frontier.
    fn queued_url(&self, _url: &UrlInfo) {}

    /// A URL left the frontier for processing.
    fn dequeued_url(&self, _url: &UrlInfo, _record: &UrlRecord) {}

    /// The crawl finished; statistics are final.
    fn finish_statistics(&self, _stats: &Statistics) {}

    /// Last word on the process exit code.
    fn exit_status(&self, code: i32) -> i32 {
        code
    }
}

/// Registration table owned by the engine.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn CrawlHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: Box<dyn CrawlHooks>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn accept_url(&self, url: &UrlInfo, record: &UrlRecord, verdict: bool) -> bool {
        let mut value = verdict;
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.accept_url(url, record, value))) {
                Ok(next) => value = next,
                Err(_) => warn!("accept_url hook panicked; keeping previous verdict"),
            }
        }
        value
    }

    pub fn handle_pre_response(&self, record: &UrlRecord, status: u16) -> HookAction {
        self.first_action(|hook| hook.handle_pre_response(record, status))
    }

    pub fn handle_response(&self, record: &UrlRecord, response: &ResponseInfo) -> HookAction {
        self.first_action(|hook| hook.handle_response(record, response))
    }

    pub fn handle_error(&self, record: &UrlRecord, error: &str) -> HookAction {
        self.first_action(|hook| hook.handle_error(record, error))
    }

    /// First non-Normal action wins.
    fn first_action(&self, f: impl Fn(&dyn CrawlHooks) -> HookAction) -> HookAction {
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| f(hook.as_ref()))) {
                Ok(HookAction::Normal) => continue,
                Ok(action) => return action,
                Err(_) => warn!("hook panicked; treating as Normal"),
            }
        }
        HookAction::Normal
    }

    pub fn get_urls(&self, record: &UrlRecord, filename: Option<&str>) -> Vec<HookUrl> {
        let mut urls = Vec::new();
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.get_urls(record, filename))) {
                Ok(mut extra) => urls.append(&mut extra),
                Err(_) => warn!("get_urls hook panicked; ignoring its URLs"),
            }
        }
        urls
    }

    pub fn wait_time(&self, seconds: Duration, record: &UrlRecord) -> Duration {
        let mut value = seconds.as_secs_f64();
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.wait_time(value, record))) {
                Ok(next) if next >= 0.0 => value = next,
                Ok(_) => {}
                Err(_) => warn!("wait_time hook panicked; keeping previous delay"),
            }
        }
        Duration::from_secs_f64(value)
    }

    pub fn queued_url(&self, url: &UrlInfo) {
        for hook in &self.hooks {
            let _ = catch_unwind(AssertUnwindSafe(|| hook.queued_url(url)));
        }
    }

    pub fn dequeued_url(&self, url: &UrlInfo, record: &UrlRecord) {
        for hook in &self.hooks {
            let _ = catch_unwind(AssertUnwindSafe(|| hook.dequeued_url(url, record)));
        }
    }

    pub fn finish_statistics(&self, stats: &Statistics) {
        for hook in &self.hooks {
            let _ = catch_unwind(AssertUnwindSafe(|| hook.finish_statistics(stats)));
        }
    }

    pub fn exit_status(&self, code: i32) -> i32 {
        let mut value = code;
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.exit_status(value))) {
                Ok(next) => value = next,
                Err(_) => warn!("exit_status hook panicked; keeping previous code"),
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::Status;

    fn record() -> UrlRecord {
        UrlRecord {
            id: 1,
            url: "http://h/a".to_string(),
            url_key: "k".to_string(),
            parent_url: None,
            root_url: "http://h/".to_string(),
            status: Status::Todo,
            try_count: 0,
            level: 0,
            inline_level: 0,
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

    struct Vetoer;
    impl CrawlHooks for Vetoer {
        fn accept_url(&self, url: &UrlInfo, _record: &UrlRecord, verdict: bool) -> bool {
            verdict && !url.path().contains("blocked")
        }
    }

    struct Retrier;
    impl CrawlHooks for Retrier {
        fn handle_error(&self, _record: &UrlRecord, _error: &str) -> HookAction {
            HookAction::Retry
        }
    }

    struct Panicker;
    impl CrawlHooks for Panicker {
        fn accept_url(&self, _url: &UrlInfo, _record: &UrlRecord, _verdict: bool) -> bool {
            panic!("plugin bug")
        }
        fn handle_error(&self, _record: &UrlRecord, _error: &str) -> HookAction {
            panic!("plugin bug")
        }
    }

    #[test]
    fn test_accept_url_veto() {
        let mut registry = HookRegistry::new();
        registry.register(Box::new(Vetoer));

        let ok = UrlInfo::parse("http://h/fine").unwrap();
        let bad = UrlInfo::parse("http://h/blocked/page").unwrap();
        assert!(registry.accept_url(&ok, &record(), true));
        assert!(!registry.accept_url(&bad, &record(), true));
        // A hook cannot resurrect a filtered URL unless it says so; here the
        // verdict passes through.
        assert!(!registry.accept_url(&ok, &record(), false));
    }

    #[test]
    fn test_first_action_wins() {
        let mut registry = HookRegistry::new();
        registry.register(Box::new(Retrier));
        assert_eq!(
            registry.handle_error(&record(), "boom"),
            HookAction::Retry
        );
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let mut registry = HookRegistry::new();
        registry.register(Box::new(Panicker));
        registry.register(Box::new(Retrier));

        let url = UrlInfo::parse("http://h/a").unwrap();
        // Panic swallowed; verdict survives.
        assert!(registry.accept_url(&url, &record(), true));
        // Later hooks still run.
        assert_eq!(registry.handle_error(&record(), "x"), HookAction::Retry);
    }

    #[test]
    fn test_wait_time_adjustment() {
        struct Doubler;
        impl CrawlHooks for Doubler {
            fn wait_time(&self, seconds: f64, _record: &UrlRecord) -> f64 {
                seconds * 2.0
            }
        }

        let mut registry = HookRegistry::new();
        registry.register(Box::new(Doubler));
        assert_eq!(
            registry.wait_time(Duration::from_secs(2), &record()),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_empty_registry_defaults() {
        let registry = HookRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.handle_pre_response(&record(), 200), HookAction::Normal);
        assert_eq!(registry.exit_status(4), 4);
    }
}
